//! Canonical binary encoding shared by shares and wire messages.
//!
//! Integers are little-endian, lengths use bitcoin's compact varint, and
//! records are the concatenation of their fields in declaration order.
//! Share identity is a hash over these bytes, so every type must round trip
//! exactly: `T::unpack(&x.pack()) == x`.

use crate::U256;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackError {
    #[error("unexpected end of input, {0} more bytes needed")]
    EarlyEnd(usize),
    #[error("{0} trailing bytes after value")]
    LateEnd(usize),
    #[error("varint not canonically packed")]
    NonCanonical,
    #[error("invalid {kind} code {value}")]
    InvalidEnum { kind: &'static str, value: u64 },
    #[error("declared length {0} exceeds input")]
    LengthOverflow(u64),
}

/// Cursor over an input buffer.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], PackError> {
        if self.remaining() < n {
            return Err(PackError::EarlyEnd(n - self.remaining()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PackError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

pub trait Pack: Sized {
    fn write(&self, out: &mut Vec<u8>);
    fn read(reader: &mut Reader<'_>) -> Result<Self, PackError>;

    fn pack(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out);
        out
    }
    /// Decodes a value that must span the whole input.
    fn unpack(data: &[u8]) -> Result<Self, PackError> {
        let mut reader = Reader::new(data);
        let value = Self::read(&mut reader)?;
        if !reader.is_empty() {
            return Err(PackError::LateEnd(reader.remaining()));
        }
        Ok(value)
    }
    fn packed_size(&self) -> usize {
        self.pack().len()
    }
}

macro_rules! impl_int {
    ($($ty:ty),*) => {
        $(
            impl Pack for $ty {
                fn write(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
                fn read(reader: &mut Reader<'_>) -> Result<Self, PackError> {
                    Ok(<$ty>::from_le_bytes(reader.take_array()?))
                }
            }
        )*
    };
}
impl_int!(u8, u16, u32, u64, u128);

impl Pack for U256 {
    fn write(&self, out: &mut Vec<u8>) {
        for i in 0..32 {
            out.push(self.byte(i));
        }
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self, PackError> {
        Ok(U256::from_little_endian(reader.take(32)?))
    }
}

/// Bitcoin compact size integer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarInt(pub u64);

impl Pack for VarInt {
    fn write(&self, out: &mut Vec<u8>) {
        match self.0 {
            n if n < 0xfd => out.push(n as u8),
            n if n <= 0xffff => {
                out.push(0xfd);
                (n as u16).write(out);
            }
            n if n <= 0xffff_ffff => {
                out.push(0xfe);
                (n as u32).write(out);
            }
            n => {
                out.push(0xff);
                n.write(out);
            }
        }
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self, PackError> {
        let (value, min) = match u8::read(reader)? {
            0xfd => (u64::from(u16::read(reader)?), 0xfd),
            0xfe => (u64::from(u32::read(reader)?), 0x1_0000),
            0xff => (u64::read(reader)?, 0x1_0000_0000),
            n => return Ok(VarInt(u64::from(n))),
        };
        if value < min {
            return Err(PackError::NonCanonical);
        }
        Ok(VarInt(value))
    }
}

pub fn write_var_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    VarInt(bytes.len() as u64).write(out);
    out.extend_from_slice(bytes);
}

pub fn read_var_bytes(reader: &mut Reader<'_>) -> Result<Vec<u8>, PackError> {
    let len = VarInt::read(reader)?.0;
    if len > reader.remaining() as u64 {
        return Err(PackError::LengthOverflow(len));
    }
    Ok(reader.take(len as usize)?.to_vec())
}

/// Length-prefixed byte string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarStr(pub Vec<u8>);

impl VarStr {
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for VarStr {
    fn from(bytes: Vec<u8>) -> Self {
        VarStr(bytes)
    }
}

impl AsRef<[u8]> for VarStr {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Pack for VarStr {
    fn write(&self, out: &mut Vec<u8>) {
        write_var_bytes(&self.0, out);
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self, PackError> {
        read_var_bytes(reader).map(VarStr)
    }
}

impl<const N: usize> Pack for [u8; N] {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self, PackError> {
        reader.take_array()
    }
}

impl<T: Pack> Pack for Vec<T> {
    fn write(&self, out: &mut Vec<u8>) {
        VarInt(self.len() as u64).write(out);
        for item in self {
            item.write(out);
        }
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self, PackError> {
        let count = VarInt::read(reader)?.0;
        // every element takes at least one byte
        if count > reader.remaining() as u64 {
            return Err(PackError::LengthOverflow(count));
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(T::read(reader)?);
        }
        Ok(items)
    }
}

impl<T: Pack> Pack for Option<T> {
    fn write(&self, out: &mut Vec<u8>) {
        match self {
            None => out.push(0),
            Some(value) => {
                out.push(1);
                value.write(out);
            }
        }
    }
    fn read(reader: &mut Reader<'_>) -> Result<Self, PackError> {
        match u8::read(reader)? {
            0 => Ok(None),
            1 => T::read(reader).map(Some),
            other => Err(PackError::InvalidEnum {
                kind: "option",
                value: u64::from(other),
            }),
        }
    }
}

/// Implements [`Pack`] for a struct as the concatenation of the listed
/// fields.
#[macro_export]
macro_rules! impl_pack {
    ($ty:ident { $($field:ident),* $(,)? }) => {
        impl $crate::pack::Pack for $ty {
            fn write(&self, out: &mut Vec<u8>) {
                $( $crate::pack::Pack::write(&self.$field, out); )*
            }
            fn read(
                reader: &mut $crate::pack::Reader<'_>,
            ) -> std::result::Result<Self, $crate::pack::PackError> {
                Ok($ty {
                    $( $field: $crate::pack::Pack::read(reader)?, )*
                })
            }
        }
    };
}

/// Implements [`Pack`] for a fieldless enum with explicit wire codes.
#[macro_export]
macro_rules! impl_pack_enum {
    ($ty:ident as $repr:ty { $($variant:ident = $code:expr),* $(,)? }) => {
        impl $crate::pack::Pack for $ty {
            fn write(&self, out: &mut Vec<u8>) {
                let code: $repr = match self {
                    $( $ty::$variant => $code, )*
                };
                $crate::pack::Pack::write(&code, out);
            }
            fn read(
                reader: &mut $crate::pack::Reader<'_>,
            ) -> std::result::Result<Self, $crate::pack::PackError> {
                let code = <$repr as $crate::pack::Pack>::read(reader)?;
                $( if code == $code { return Ok($ty::$variant); } )*
                Err($crate::pack::PackError::InvalidEnum {
                    kind: stringify!($ty),
                    value: u64::from(code),
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Record {
        a: u32,
        b: VarStr,
        c: Vec<u64>,
        d: Option<[u8; 4]>,
    }
    impl_pack!(Record { a, b, c, d });

    #[derive(Debug, PartialEq)]
    enum Color {
        Red,
        Blue,
    }
    impl_pack_enum!(Color as u8 { Red = 1, Blue = 7 });

    #[test]
    fn varint_boundaries() {
        for (value, len) in [
            (0u64, 1usize),
            (0xfc, 1),
            (0xfd, 3),
            (0xffff, 3),
            (0x1_0000, 5),
            (0xffff_ffff, 5),
            (0x1_0000_0000, 9),
            (u64::MAX, 9),
        ] {
            let packed = VarInt(value).pack();
            assert_eq!(packed.len(), len, "value {value:#x}");
            assert_eq!(VarInt::unpack(&packed).unwrap(), VarInt(value));
        }
    }

    #[test]
    fn varint_rejects_non_canonical() {
        assert_eq!(VarInt::unpack(&[0xfd, 0x10, 0x00]), Err(PackError::NonCanonical));
        assert_eq!(
            VarInt::unpack(&[0xfe, 0xff, 0xff, 0x00, 0x00]),
            Err(PackError::NonCanonical)
        );
    }

    #[test]
    fn record_round_trip() {
        let record = Record {
            a: 0xdeadbeef,
            b: VarStr(b"hello".to_vec()),
            c: vec![1, 2, u64::MAX],
            d: Some(*b"abcd"),
        };
        let packed = record.pack();
        assert_eq!(packed.len(), record.packed_size());
        assert_eq!(&packed[..4], &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(Record::unpack(&packed).unwrap(), record);
    }

    #[test]
    fn trailing_and_truncated_input() {
        let mut packed = 7u32.pack();
        packed.push(0);
        assert_eq!(u32::unpack(&packed), Err(PackError::LateEnd(1)));
        assert_eq!(u32::unpack(&packed[..2]), Err(PackError::EarlyEnd(2)));
        // declared length larger than the buffer
        assert_eq!(VarStr::unpack(&[5, 1, 2]), Err(PackError::LengthOverflow(5)));
    }

    #[test]
    fn enum_codes() {
        assert_eq!(Color::Blue.pack(), vec![7]);
        assert_eq!(Color::unpack(&[1]).unwrap(), Color::Red);
        assert!(matches!(
            Color::unpack(&[2]),
            Err(PackError::InvalidEnum { value: 2, .. })
        ));
        assert!(Option::<u8>::unpack(&[2, 0]).is_err());
    }

    #[test]
    fn u256_is_little_endian() {
        let value = U256::from(0x0102u64);
        let packed = value.pack();
        assert_eq!(packed.len(), 32);
        assert_eq!(&packed[..2], &[0x02, 0x01]);
        assert_eq!(U256::unpack(&packed).unwrap(), value);
    }
}
