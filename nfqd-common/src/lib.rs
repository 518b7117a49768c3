#![no_std]

//! Constants fixed by the kernel `NFQUEUE` contract.
//!
//! Everything in here is shared between the userspace dispatcher and anything
//! that needs to speak the same numeric language as the kernel (firewall rule
//! generators, test fixtures), so it stays free of `std`.

use core::fmt;

/// Default number of payload bytes copied to userspace per packet.
pub const DEFAULT_PACKET_SIZE: u32 = 0xffff;

/// Number of bits the target queue number is shifted by in a `QUEUE` verdict.
pub const QUEUE_SHIFT: u32 = 16;

/// Final decision for a queued packet. Values are the kernel's `NF_*` codes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Drop = 0,
    Accept = 1,
    Stolen = 2,
    Queue = 3,
    Repeat = 4,
    Stop = 5,
}

impl Verdict {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Verdict::Drop => "NF_DROP",
            Verdict::Accept => "NF_ACCEPT",
            Verdict::Stolen => "NF_STOLEN",
            Verdict::Queue => "NF_QUEUE",
            Verdict::Repeat => "NF_REPEAT",
            Verdict::Stop => "NF_STOP",
        }
    }
}

impl TryFrom<u32> for Verdict {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Verdict::Drop),
            1 => Ok(Verdict::Accept),
            2 => Ok(Verdict::Stolen),
            3 => Ok(Verdict::Queue),
            4 => Ok(Verdict::Repeat),
            5 => Ok(Verdict::Stop),
            other => Err(other),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compose a `QUEUE` verdict that moves the packet to `queue`.
///
/// The target queue number travels in the upper 16 bits of the verdict word.
pub const fn requeue_verdict(queue: u16) -> u32 {
    Verdict::Queue.as_u32() | ((queue as u32) << QUEUE_SHIFT)
}

/// Application level disposition tag written to the packet mark.
///
/// The values live in the `0x11000..=0x11012` band so they do not collide
/// with marks owned by unrelated firewall tooling.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mark {
    Drop = 0x11000,
    Accept = 0x11001,
    Return = 0x11002,
    Repeat = 0x11003,
    DropLog = 0x11010,
    AcceptLog = 0x11011,
    ReturnLog = 0x11012,
}

impl Mark {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Verdict that accompanies this mark when it is set on a packet.
    ///
    /// Only `Repeat` re-runs the hook; every other mark accepts the packet and
    /// leaves the final decision to rules matching on the mark.
    pub const fn verdict(self) -> Verdict {
        match self {
            Mark::Repeat => Verdict::Repeat,
            _ => Verdict::Accept,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Mark::Drop => "NF_MARK_DROP",
            Mark::Accept => "NF_MARK_ACCEPT",
            Mark::Return => "NF_MARK_RETURN",
            Mark::Repeat => "NF_MARK_REPEAT",
            Mark::DropLog => "NF_MARK_DROP_LOG",
            Mark::AcceptLog => "NF_MARK_ACCEPT_LOG",
            Mark::ReturnLog => "NF_MARK_RETURN_LOG",
        }
    }
}

impl TryFrom<u32> for Mark {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x11000 => Ok(Mark::Drop),
            0x11001 => Ok(Mark::Accept),
            0x11002 => Ok(Mark::Return),
            0x11003 => Ok(Mark::Repeat),
            0x11010 => Ok(Mark::DropLog),
            0x11011 => Ok(Mark::AcceptLog),
            0x11012 => Ok(Mark::ReturnLog),
            other => Err(other),
        }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address families a queue handler is bound to.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    Inet = 2,
    Inet6 = 10,
}

impl ProtocolFamily {
    pub const ALL: [ProtocolFamily; 2] = [ProtocolFamily::Inet, ProtocolFamily::Inet6];

    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolFamily::Inet => f.write_str("AF_INET"),
            ProtocolFamily::Inet6 => f.write_str("AF_INET6"),
        }
    }
}

/// How much of each packet the kernel copies into a queue message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    None = 0,
    Meta = 1,
    Packet = 2,
}

impl CopyMode {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}
