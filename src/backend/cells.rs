use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{BackendError, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCell {
    pub token: Token,
    pub pos: usize,
}

/// Logical view of the KV cache: which token sits at which position.
///
/// Backends that cannot edit their physical cache in place rebuild it from
/// these cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvCells {
    cells: Vec<KvCell>,
}

impl KvCells {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    pub fn next_pos(&self) -> usize {
        self.cells.iter().map(|c| c.pos + 1).max().unwrap_or(0)
    }

    pub fn push_batch(&mut self, tokens: &[Token], start_pos: usize) {
        self.cells.retain(|c| c.pos < start_pos);
        self.cells.extend(
            tokens
                .iter()
                .enumerate()
                .map(|(i, &token)| KvCell { token, pos: start_pos + i }),
        );
    }

    /// Returns the number of cells dropped.
    pub fn remove(&mut self, p0: usize, p1: Option<usize>) -> usize {
        let before = self.cells.len();
        let end = p1.unwrap_or(usize::MAX);
        self.cells.retain(|c| c.pos < p0 || c.pos >= end);
        before - self.cells.len()
    }

    /// Moves cells in `[p0, p1)` by `delta`. Cells pushed below zero are dropped.
    pub fn shift(&mut self, p0: usize, p1: usize, delta: isize) {
        self.cells.retain_mut(|c| {
            if c.pos < p0 || c.pos >= p1 {
                return true;
            }
            match c.pos.checked_add_signed(delta) {
                Some(pos) => {
                    c.pos = pos;
                    true
                }
                None => false,
            }
        });
    }

    pub fn divide(&mut self, p0: usize, p1: usize, divisor: usize) {
        if divisor <= 1 {
            return;
        }
        for cell in self.cells.iter_mut().filter(|c| c.pos >= p0 && c.pos < p1) {
            cell.pos /= divisor;
        }
    }

    /// True when positions are exactly `0..len` with no duplicates.
    pub fn is_contiguous(&self) -> bool {
        let mut positions: Vec<usize> = self.cells.iter().map(|c| c.pos).collect();
        positions.sort_unstable();
        positions.iter().enumerate().all(|(i, &p)| i == p)
    }

    pub fn tokens_in_order(&self) -> Vec<Token> {
        let mut ordered = self.cells.clone();
        ordered.sort_by_key(|c| c.pos);
        ordered.into_iter().map(|c| c.token).collect()
    }

    pub fn last_token(&self) -> Option<Token> {
        self.cells.iter().max_by_key(|c| c.pos).map(|c| c.token)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KvCell> {
        self.cells.iter()
    }
}

/// Snapshot of a context: the KV cells plus the logits of the last
/// evaluated token, so a restored context can sample without re-decoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextState {
    pub cells: KvCells,
    pub logits: Option<Vec<f32>>,
}

impl ContextState {
    pub fn to_bytes(&self) -> Result<Vec<u8>, BackendError> {
        let mut out = Vec::with_capacity(16 + self.cells.len() * 12);
        self.write_into(&mut out)
            .map_err(|e| BackendError::State(e.to_string()))?;
        Ok(out)
    }

    fn write_into(&self, out: &mut Vec<u8>) -> std::io::Result<()> {
        out.write_u32::<LittleEndian>(self.cells.len() as u32)?;
        for cell in self.cells.iter() {
            out.write_u32::<LittleEndian>(cell.token)?;
            out.write_u64::<LittleEndian>(cell.pos as u64)?;
        }
        match &self.logits {
            Some(logits) => {
                out.write_u8(1)?;
                out.write_u32::<LittleEndian>(logits.len() as u32)?;
                for v in logits {
                    out.write_f32::<LittleEndian>(*v)?;
                }
            }
            None => out.write_u8(0)?,
        }
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BackendError> {
        let mut rdr = Cursor::new(bytes);
        let state = Self::read_from(&mut rdr).map_err(|e| BackendError::State(e.to_string()))?;
        if rdr.position() as usize != bytes.len() {
            return Err(BackendError::State("trailing bytes after state".to_string()));
        }
        Ok(state)
    }

    fn read_from(rdr: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        let n_cells = rdr.read_u32::<LittleEndian>()? as usize;
        let mut cells = KvCells::default();
        for _ in 0..n_cells {
            let token = rdr.read_u32::<LittleEndian>()?;
            let pos = rdr.read_u64::<LittleEndian>()? as usize;
            cells.cells.push(KvCell { token, pos });
        }
        let logits = match rdr.read_u8()? {
            0 => None,
            _ => {
                let n = rdr.read_u32::<LittleEndian>()? as usize;
                let mut values = Vec::with_capacity(n.min(1 << 20));
                for _ in 0..n {
                    values.push(rdr.read_f32::<LittleEndian>()?);
                }
                Some(values)
            }
        };
        Ok(Self { cells, logits })
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextState, KvCells};

    fn cells_of(n: u32) -> KvCells {
        let mut cells = KvCells::default();
        let tokens: Vec<u32> = (100..100 + n).collect();
        cells.push_batch(&tokens, 0);
        cells
    }

    #[test]
    fn context_shift_keeps_positions_contiguous() {
        let mut cells = cells_of(10);
        let (n_keep, n_discard, n_past) = (2, 4, 10);
        cells.remove(n_keep, Some(n_keep + n_discard));
        cells.shift(n_keep + n_discard, n_past, -(n_discard as isize));

        assert_eq!(cells.len(), 6);
        assert!(cells.is_contiguous());
        assert_eq!(cells.tokens_in_order(), vec![100, 101, 106, 107, 108, 109]);
        assert_eq!(cells.next_pos(), 6);
    }

    #[test]
    fn push_batch_overwrites_tail() {
        let mut cells = cells_of(5);
        cells.push_batch(&[7, 8], 3);
        assert_eq!(cells.tokens_in_order(), vec![100, 101, 102, 7, 8]);
    }

    #[test]
    fn divide_groups_positions() {
        let mut cells = cells_of(8);
        cells.divide(4, 8, 2);
        assert!(!cells.is_contiguous());
        assert_eq!(cells.next_pos(), 4);
    }

    #[test]
    fn truncated_state_is_rejected() {
        let state = ContextState {
            cells: cells_of(3),
            logits: Some(vec![0.5, -1.0]),
        };
        let bytes = state.to_bytes().expect("encode state");
        assert_eq!(ContextState::from_bytes(&bytes).expect("decode state"), state);
        assert!(ContextState::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
