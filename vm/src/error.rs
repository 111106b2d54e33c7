use crate::block::BlockError;
use core::fmt;

/// Cause of a failed transfer between a frame and its backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The swap device rejected a sector transfer.
    Block(BlockError),
    /// The backing file returned fewer bytes than the page needs.
    ShortRead { expected: usize, actual: usize },
    /// The backing file accepted fewer bytes than were written back.
    ShortWrite { expected: usize, actual: usize },
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block(e) => write!(f, "block device: {e}"),
            Self::ShortRead { expected, actual } => {
                write!(f, "short read ({actual} of {expected} bytes)")
            }
            Self::ShortWrite { expected, actual } => {
                write!(f, "short write ({actual} of {expected} bytes)")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No page is declared at the faulting address. Fatal to the process.
    IllegalAccess { addr: usize },
    /// A page could not be moved to or from its backing store.
    Io(IoError),
    /// Every swap slot holds live data.
    SwapExhausted,
    /// The page is already declared in this address space.
    Duplicate { upage: usize },
    /// No such page or mapping.
    NotFound,
    /// Memory is full and no frame can be evicted, e.g. every resident page is pinned.
    EvictionDeadlock,
    /// The page directory could not install a mapping.
    MappingFailed { upage: usize },
    /// Arguments to `mmap` do not describe a mappable region.
    InvalidMapping,
    /// A kernel write through a user address hit a read-only page.
    ReadOnly { addr: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalAccess { addr } => write!(f, "illegal access at {addr:#x}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::SwapExhausted => write!(f, "swap space exhausted"),
            Self::Duplicate { upage } => write!(f, "page {upage:#x} already declared"),
            Self::NotFound => write!(f, "not found"),
            Self::EvictionDeadlock => write!(f, "no evictable frame"),
            Self::MappingFailed { upage } => write!(f, "could not map page {upage:#x}"),
            Self::InvalidMapping => write!(f, "invalid mapping"),
            Self::ReadOnly { addr } => write!(f, "write to read-only page at {addr:#x}"),
        }
    }
}

impl core::error::Error for VmError {}

impl From<IoError> for VmError {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl From<BlockError> for VmError {
    fn from(e: BlockError) -> Self {
        Self::Io(IoError::Block(e))
    }
}

pub type Result<T> = core::result::Result<T, VmError>;
