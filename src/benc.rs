//! Minimal zero-copy bencode walker.
//!
//! Used where byte-exact slices matter (the raw `info` value of a torrent,
//! KRPC datagrams). Full decoding goes through `rbit::bencode`.

/// Deepest list/dict nesting accepted, matching `rbit::bencode`.
pub const MAX_DEPTH: usize = 64;

pub struct BencDict<'a> {
    raw: &'a [u8],
}

impl<'a> BencDict<'a> {
    pub fn parse(raw: &'a [u8]) -> Option<Self> {
        BencParser::new(raw).parse_dict()
    }

    /// Like `parse`, but the dictionary must span the whole input.
    pub fn parse_exact(raw: &'a [u8]) -> Option<Self> {
        let dict = Self::parse(raw)?;
        (dict.raw.len() == raw.len()).then_some(dict)
    }

    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    /// Raw encoded form of the value stored under `key`, whatever its type.
    pub fn get_raw(&self, key: &[u8]) -> Option<&'a [u8]> {
        let mut p = BencParser::new(self.raw);
        p.expect_byte(b'd')?;
        loop {
            if p.peek()? == b'e' {
                return None;
            }
            let k = p.parse_bytes()?;
            let v_start = p.pos;
            p.skip_value()?;
            if k == key {
                return self.raw.get(v_start..p.pos);
            }
        }
    }

    pub fn get_bytes(&self, key: &[u8]) -> Option<&'a [u8]> {
        let v = self.get_raw(key)?;
        if !v.first()?.is_ascii_digit() {
            return None;
        }
        BencParser::new(v).parse_bytes()
    }

    pub fn get_dict(&self, key: &[u8]) -> Option<BencDict<'a>> {
        let v = self.get_raw(key)?;
        if *v.first()? != b'd' {
            return None;
        }
        Some(BencDict { raw: v })
    }

    pub fn get_int(&self, key: &[u8]) -> Option<i64> {
        let v = self.get_raw(key)?;
        let body = v.strip_prefix(b"i")?.strip_suffix(b"e")?;
        std::str::from_utf8(body).ok()?.parse().ok()
    }

    /// Byte-string items of the list under `key`; other item types are skipped.
    pub fn get_list_bytes(&self, key: &[u8]) -> Option<Vec<&'a [u8]>> {
        let v = self.get_raw(key)?;
        let mut p = BencParser::new(v);
        p.expect_byte(b'l')?;
        let mut out = Vec::new();
        while p.peek()? != b'e' {
            match p.peek()? {
                b'0'..=b'9' => out.push(p.parse_bytes()?),
                _ => p.skip_value()?,
            }
        }
        Some(out)
    }
}

struct BencParser<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> BencParser<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self { raw, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.raw.get(self.pos).copied()
    }

    fn expect_byte(&mut self, b: u8) -> Option<()> {
        if self.peek()? != b {
            return None;
        }
        self.pos += 1;
        Some(())
    }

    fn parse_dict(mut self) -> Option<BencDict<'a>> {
        if self.peek()? != b'd' {
            return None;
        }
        let start = self.pos;
        self.skip_value()?;
        let end = self.pos;
        Some(BencDict {
            raw: self.raw.get(start..end)?,
        })
    }

    fn parse_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.parse_usize()?;
        self.expect_byte(b':')?;
        let start = self.pos;
        let end = self.pos.checked_add(len)?;
        let out = self.raw.get(start..end)?;
        self.pos = end;
        Some(out)
    }

    fn parse_usize(&mut self) -> Option<usize> {
        let mut n: usize = 0;
        let mut saw = false;
        while let Some(b) = self.peek() {
            if !b.is_ascii_digit() {
                break;
            }
            saw = true;
            n = n.checked_mul(10)?.checked_add((b - b'0') as usize)?;
            self.pos += 1;
        }
        if !saw { None } else { Some(n) }
    }

    fn skip_value(&mut self) -> Option<()> {
        self.skip_nested(0)
    }

    fn skip_nested(&mut self, depth: usize) -> Option<()> {
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.pos += 1;
                }
                self.pos += 1;
                Some(())
            }
            b'l' | b'd' if depth >= MAX_DEPTH => None,
            b'l' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.skip_nested(depth + 1)?;
                }
                self.pos += 1;
                Some(())
            }
            b'd' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.parse_bytes()?;
                    self.skip_nested(depth + 1)?;
                }
                self.pos += 1;
                Some(())
            }
            b'0'..=b'9' => {
                self.parse_bytes()?;
                Some(())
            }
            _ => None,
        }
    }
}

/// Appends a bencoded byte string.
pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}
