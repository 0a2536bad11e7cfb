//! Rich table detection inside the DOS stub.
//!
//! The Rich table is an undocumented structure emitted by Microsoft linkers
//! between the DOS stub code and the PE signature. It is a "DanS" marker,
//! zero padding and (comp_id, use_count) pairs, all XORed with a key that
//! follows the plain-text "Rich" footer.

/// "Rich" footer marker (stored unencoded).
pub const RICH_MARKER: u32 = 0x68636952;

/// "DanS" start marker (stored XORed with the key).
pub const DANS_MARKER: u32 = 0x536E6144;

/// A single Rich table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RichEntry {
    /// Product ID (compiler/tool identifier).
    pub product_id: u16,
    /// Build number.
    pub build_number: u16,
    /// Use count.
    pub use_count: u32,
}

impl RichEntry {
    /// Create from raw comp_id value.
    pub fn from_comp_id(comp_id: u32, use_count: u32) -> Self {
        Self {
            product_id: (comp_id >> 16) as u16,
            build_number: (comp_id & 0xFFFF) as u16,
            use_count,
        }
    }

    /// Convert to comp_id value.
    pub fn to_comp_id(&self) -> u32 {
        ((self.product_id as u32) << 16) | (self.build_number as u32)
    }
}

/// Rich table found in a DOS stub.
///
/// `start` and `end` are offsets into the stub (not the file), covering the
/// encoded "DanS" marker through the key that follows "Rich".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RichTable {
    /// XOR key.
    pub key: u32,
    /// Tool entries in table order.
    pub entries: Vec<RichEntry>,
    /// Stub offset of the encoded "DanS" marker.
    pub start: usize,
    /// Stub offset one past the key.
    pub end: usize,
}

fn dword(stub: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        stub[offset],
        stub[offset + 1],
        stub[offset + 2],
        stub[offset + 3],
    ])
}

fn find_marker(stub: &[u8], marker: u32) -> Option<usize> {
    stub.windows(4)
        .position(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]) == marker)
}

impl RichTable {
    /// Look for a Rich table in `stub`. Returns `None` if there is none or it
    /// is not well formed.
    pub fn parse(stub: &[u8]) -> Option<Self> {
        let footer = find_marker(stub, RICH_MARKER)?;
        if footer < 4 || footer + 8 > stub.len() {
            return None;
        }

        let key = dword(stub, footer + 4);

        // Walk back to the DanS marker, counting the dwords in between.
        let mut padded_dwords = 0usize;
        let mut cursor = footer - 4;
        let dans = loop {
            if dword(stub, cursor) ^ key == DANS_MARKER {
                break cursor;
            }
            padded_dwords += 1;
            cursor = cursor.checked_sub(4)?;
        };

        // Leading zero dwords are padding, not entries.
        let mut value_offset = dans + 4;
        let mut dwords = padded_dwords;
        while dwords > 0 && dword(stub, value_offset) ^ key == 0 {
            dwords -= 1;
            value_offset += 4;
        }

        let count = dwords / 2;
        let first = footer - count * 8;
        let entries = (0..count)
            .map(|i| {
                let at = first + i * 8;
                RichEntry::from_comp_id(dword(stub, at) ^ key, dword(stub, at + 4) ^ key)
            })
            .collect();

        log::trace!("rich table: {count} entries, key {key:#010x}");

        Some(Self {
            key,
            entries,
            start: dans,
            end: footer + 8,
        })
    }

    /// Encode the table (DanS, three padding dwords, entries, footer, key).
    pub fn to_bytes(&self) -> Vec<u8> {
        let key = self.key;
        let mut buf = Vec::with_capacity(16 + self.entries.len() * 8 + 8);

        buf.extend_from_slice(&(DANS_MARKER ^ key).to_le_bytes());
        for _ in 0..3 {
            buf.extend_from_slice(&key.to_le_bytes());
        }
        for entry in &self.entries {
            buf.extend_from_slice(&(entry.to_comp_id() ^ key).to_le_bytes());
            buf.extend_from_slice(&(entry.use_count ^ key).to_le_bytes());
        }
        buf.extend_from_slice(&RICH_MARKER.to_le_bytes());
        buf.extend_from_slice(&key.to_le_bytes());

        buf
    }

    /// Size in bytes of the encoded region.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
