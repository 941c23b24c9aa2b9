use core::str;
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::Deref;

use anyhow::Context;

pub trait FromBuf: Sized {
    fn from_buf(buf: &mut ByteBuf) -> anyhow::Result<Self>;
}

pub trait EncodeToBuf {
    fn encode_to_buf_with_cache<'cache, 'r: 'cache>(
        &'r self,
        buf: &mut ByteBuf,
        label_cache: Option<&mut HashMap<&'cache str, usize>>,
    ) -> anyhow::Result<usize>;

    fn encode_to_buf(&self, buf: &mut ByteBuf) -> anyhow::Result<usize> {
        self.encode_to_buf_with_cache(buf, None)
    }
}

/// Bounds-checked cursor over a DNS message.
///
/// Every read advances `pos` and fails with an error instead of slicing out
/// of bounds, so record parsing can never walk past a truncated message.
pub struct ByteBuf<'a> {
    buf: Cow<'a, [u8]>,
    pos: usize,
}

impl<'a> Deref for ByteBuf<'a> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref()
    }
}

impl<'a> AsRef<[u8]> for ByteBuf<'a> {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl<'a> ByteBuf<'a> {
    pub fn new(src: &impl AsRef<[u8]>) -> ByteBuf<'_> {
        ByteBuf {
            buf: Cow::Borrowed(src.as_ref()),
            pos: 0,
        }
    }

    pub fn new_from_vec(src: Vec<u8>) -> ByteBuf<'static> {
        ByteBuf {
            buf: Cow::Owned(src),
            pos: 0,
        }
    }

    pub fn new_empty(capacity: Option<usize>) -> ByteBuf<'static> {
        ByteBuf {
            buf: Cow::Owned(Vec::with_capacity(capacity.unwrap_or(512))),
            pos: 0,
        }
    }

    pub fn into_inner(self) -> Cow<'a, [u8]> {
        self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.into_owned()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn advance(&mut self, n: usize) -> anyhow::Result<()> {
        self.ensure_length(n, None)?;
        self.pos += n;
        Ok(())
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        self.ensure_length(1, None)?;
        let byte = self.buf[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> anyhow::Result<u16> {
        self.read_bytes(2)
            .and_then(|bytes| TryInto::<[u8; 2]>::try_into(bytes).context("bug: should be exactly two bytes"))
            .map(u16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        self.read_bytes(4)
            .and_then(|bytes| TryInto::<[u8; 4]>::try_into(bytes).context("bug: should be exactly four bytes"))
            .map(u32::from_be_bytes)
    }

    /// Reads a 48-bit big-endian integer (TSIG "time signed") into the low
    /// bits of a u64.
    pub fn read_u48(&mut self) -> anyhow::Result<u64> {
        let bytes = self.read_bytes(6)?;
        let mut value = 0u64;
        for byte in bytes {
            value = (value << 8) | *byte as u64;
        }
        Ok(value)
    }

    pub fn peek_u16(&self, pos: usize) -> anyhow::Result<u16> {
        self.peek_bytes(pos, 2)
            .and_then(|bytes| TryInto::<[u8; 2]>::try_into(bytes).context("bug: should be exactly two bytes"))
            .map(u16::from_be_bytes)
    }

    pub fn read_bytes(&mut self, n: usize) -> anyhow::Result<&[u8]> {
        self.ensure_length(n, None)?;
        let pos = self.pos;
        self.pos += n;
        self.get_range(pos, n).context("bug: should be present")
    }

    pub fn peek_bytes(&self, pos: usize, n: usize) -> anyhow::Result<&[u8]> {
        self.ensure_length(n, Some(pos))?;
        self.get_range(pos, n).context("bug: should be present")
    }

    pub fn write_u8(&mut self, data: u8) {
        self.buf.to_mut().push(data);
    }

    pub fn write_u16(&mut self, data: u16) {
        self.buf.to_mut().extend_from_slice(&data.to_be_bytes());
    }

    pub fn write_u32(&mut self, data: u32) {
        self.buf.to_mut().extend_from_slice(&data.to_be_bytes());
    }

    /// Writes the low 48 bits of `data` as 6 bytes, MSB first.
    pub fn write_u48(&mut self, data: u64) {
        let data = data & 0xFFFF_FFFF_FFFF;
        self.buf.to_mut().extend_from_slice(&data.to_be_bytes()[2..]);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.to_mut().extend_from_slice(data);
    }

    /// Patches two bytes in place. Used to fix up RDLENGTH and RR counts
    /// after the fact.
    pub fn set_u16(&mut self, pos: usize, data: u16) -> anyhow::Result<()> {
        self.ensure_length(2, Some(pos))?;
        let bytes = data.to_be_bytes();
        let buf = self.buf.to_mut();
        buf[pos] = bytes[0];
        buf[pos + 1] = bytes[1];
        Ok(())
    }

    /// Walks the name starting at `pos` without decoding it and returns the
    /// number of bytes it occupies in place (a compression pointer counts as
    /// two bytes and terminates the walk).
    pub fn qname_wire_len(&self, pos: usize) -> anyhow::Result<usize> {
        let mut cursor = pos;
        loop {
            self.ensure_length(1, Some(cursor))
                .context("malformed packet: truncated name")?;
            let label_len = self.buf[cursor];
            if label_len & 0xC0 == 0xC0 {
                self.ensure_length(2, Some(cursor))
                    .context("malformed packet: truncated compression pointer")?;
                cursor += 2;
                break;
            }
            cursor += 1 + label_len as usize;
            self.ensure_length(0, Some(cursor))
                .context("malformed packet: label overruns the message")?;
            if label_len == 0 {
                break;
            }
        }
        Ok(cursor - pos)
    }

    /// Decodes a possibly-compressed domain name at the current position.
    ///
    /// Pointer hops are capped at the message length: any chain longer than
    /// that (which includes every cycle) is rejected instead of looping.
    pub fn read_qname(&mut self) -> anyhow::Result<Cow<'static, str>> {
        let max_hops = self.buf.len();
        let mut hops = 0usize;
        let mut jumped = false;
        let mut pos = self.pos;
        let mut labels: Vec<String> = Vec::new();

        loop {
            self.ensure_length(1, Some(pos))
                .context("malformed packet: expected name label length")?;
            let label_len = self.buf[pos];

            if label_len & 0xC0 == 0xC0 {
                self.ensure_length(2, Some(pos))
                    .context("malformed packet: expected second compression pointer byte")?;
                hops += 1;
                if hops > max_hops {
                    anyhow::bail!("malformed packet: compression pointer loop in name");
                }
                let target = (((label_len as u16) ^ 0xC0) << 8) | self.buf[pos + 1] as u16;
                if !jumped {
                    self.pos = pos + 2;
                    jumped = true;
                }
                pos = target as usize;
                continue;
            }

            pos += 1;
            if label_len == 0 {
                if !jumped {
                    self.pos = pos;
                }
                break;
            }
            if label_len > 63 {
                anyhow::bail!("malformed packet: label length {} exceeds 63", label_len);
            }

            let label = self
                .buf
                .get(pos..pos + label_len as usize)
                .with_context(|| format!("malformed packet: expected label of length {} at byte {}", label_len, pos))?;
            let label = str::from_utf8(label)
                .with_context(|| format!("malformed packet: name label at byte {} is not UTF-8", pos))?;
            labels.push(label.to_owned());
            pos += label_len as usize;

            if !jumped {
                self.pos = pos;
            }
        }

        let qname = if labels.is_empty() {
            "".into()
        } else {
            labels.join(".").into()
        };

        Ok(qname)
    }

    /// Encodes a domain name at the end of the buffer. With a label cache,
    /// previously written suffixes are replaced by a 0xC0 pointer.
    pub fn write_qname<'cache, 'name: 'cache>(
        &mut self,
        qname: &'name str,
        label_cache: Option<&mut HashMap<&'cache str, usize>>,
    ) -> anyhow::Result<usize> {
        let name_start = self.buf.len();
        let mut written = 0;
        let mut compressed = false;

        for (idx, label) in qname.split('.').enumerate() {
            if label.len() > 63 {
                anyhow::bail!("label is too long ({}): {}", label.len(), label);
            }
            if label.is_empty() {
                continue;
            }

            let suffix = qname.splitn(idx + 1, '.').last().unwrap_or(qname);
            if let Some(offset) = label_cache.as_ref().and_then(|cache| cache.get(suffix)) {
                // Pointers only reach the first 16K of the message
                if *offset <= 0x3FFF {
                    self.write_u16(0xC000 | *offset as u16);
                    written += 2;
                    compressed = true;
                    break;
                }
            }

            self.write_u8(label.len() as u8);
            self.write_bytes(label.as_bytes());
            written += 1 + label.len();
        }

        if written > 0 && name_start <= 0x3FFF {
            if let Some(cache) = label_cache {
                cache.insert(qname, name_start);
            }
        }

        if !compressed {
            self.write_u8(0);
            written += 1;
        }

        Ok(written)
    }

    fn ensure_length(&self, n: usize, pos: Option<usize>) -> anyhow::Result<()> {
        if self.buf.len() < pos.unwrap_or(self.pos) + n {
            anyhow::bail!("underlying buffer is too small")
        }
        Ok(())
    }

    fn get_range(&self, pos: usize, len: usize) -> Option<&[u8]> {
        self.buf.get(pos..pos + len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_root_qname() {
        let mut buf = ByteBuf::new(&[0x0]);
        let result = buf.read_qname().expect("shouldn't have failed");
        assert_eq!(result, "");
    }

    #[test]
    fn read_valid_qname() {
        let raw = &[0x7, 0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x3, 0x63, 0x6f, 0x6d, 0x0];
        let mut buf = ByteBuf::new(raw);
        let result = buf.read_qname().expect("shouldn't have failed");
        assert_eq!(result, "example.com");
        assert_eq!(buf.pos(), raw.len());
    }

    #[test]
    fn read_qname_overrunning_label() {
        let mut buf = ByteBuf::new(&[0x8, 0x65, 0x78]);
        assert!(buf.read_qname().is_err());
    }

    #[test]
    fn read_qname_without_terminator() {
        let mut buf = ByteBuf::new(&[0x2, 0x65, 0x78]);
        assert!(buf.read_qname().is_err());
    }

    #[test]
    fn read_qname_rejects_self_pointer() {
        // Pointer at offset 0 that points back to offset 0
        let mut buf = ByteBuf::new(&[0xC0, 0x00]);
        let err = buf.read_qname().expect_err("pointer cycle must be rejected");
        assert!(err.to_string().contains("loop"), "unexpected error: {err:#}");
    }

    #[test]
    fn read_qname_rejects_pointer_cycle() {
        // Two pointers that point at each other
        let mut buf = ByteBuf::new(&[0xC0, 0x02, 0xC0, 0x00]);
        assert!(buf.read_qname().is_err());
    }

    #[test]
    fn read_qname_follows_pointer() {
        let raw = &[
            0x3, 0x63, 0x6f, 0x6d, 0x0, // "com" at offset 0
            0x3, 0x77, 0x77, 0x77, 0xC0, 0x0, // "www" + pointer to "com"
        ];
        let mut buf = ByteBuf::new(raw);
        buf.seek(5);
        let result = buf.read_qname().expect("shouldn't have failed");
        assert_eq!(result, "www.com");
        assert_eq!(buf.pos(), raw.len());
    }

    #[test]
    fn write_root_qname() {
        let mut buf = ByteBuf::new_empty(None);
        let written = buf.write_qname(".", None).expect("shouldn't have failed");
        assert_eq!(written, 1);
        assert_eq!(&*buf, &[0x0]);
    }

    #[test]
    fn write_qname_rejects_long_label() {
        let qname = format!("{}.com", "a".repeat(64));
        let mut buf = ByteBuf::new_empty(None);
        assert!(buf.write_qname(&qname, None).is_err());
    }

    #[test]
    fn write_qname_with_cache() {
        let mut buf = ByteBuf::new_empty(None);
        let mut cache = HashMap::new();

        buf.write_qname("example.com", Some(&mut cache)).expect("first name");
        assert!(cache.get("example.com").is_some_and(|pos| *pos == 0));

        let written = buf.write_qname("ns1.example.com", Some(&mut cache)).expect("second name");
        // "ns1" label + 2 pointer bytes
        assert_eq!(written, 4 + 2);
        assert_eq!(&buf[13..], &[0x3, 0x6e, 0x73, 0x31, 0xC0, 0x0]);
    }

    #[test]
    fn u48_roundtrip() {
        let mut buf = ByteBuf::new_empty(None);
        buf.write_u48(0x0000_1234_5678_9ABC);
        assert_eq!(buf.len(), 6);
        let value = buf.read_u48().expect("shouldn't have failed");
        assert_eq!(value, 0x1234_5678_9ABC);
    }

    #[test]
    fn u48_masks_high_bits() {
        let mut buf = ByteBuf::new_empty(None);
        buf.write_u48(0xFFFF_0000_0000_0001);
        let value = buf.read_u48().expect("shouldn't have failed");
        assert_eq!(value, 0x1);
    }

    #[test]
    fn set_u16_patches_in_place() {
        let mut buf = ByteBuf::new_from_vec(vec![0, 0, 0, 0]);
        buf.set_u16(2, 0xBEEF).expect("shouldn't have failed");
        assert_eq!(&*buf, &[0, 0, 0xBE, 0xEF]);
    }
}
