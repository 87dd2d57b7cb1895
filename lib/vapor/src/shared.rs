use std::io;

pub type WireResult<T> = Result<T, WireError>;

/// Errors produced while encoding or decoding wire messages. `Truncated` means
/// the source ran dry or the destination ran out of room; `Malformed` means the
/// bytes were present but did not parse.
#[derive(Debug, Eq, PartialEq)]
pub enum WireError {
    Truncated,
    Malformed,
}

impl From<io::Error> for WireError {
    #[inline]
    fn from(_: io::Error) -> Self {
        WireError::Truncated
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

/// Trait for manually serialized objects. Implementors must validate the
/// remaining free capacity in the stream upfront and only write into it if all
/// the content they wish to write fits.
pub trait Serialize {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> WireResult<()>;
}

/// Trait for manually deserialized objects.
pub trait Deserialize: Sized {
    fn deserialize<R: SizedRead>(stream: &mut R) -> WireResult<Self>;
}
