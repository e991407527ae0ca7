//! Move-to-front transform over template ids.
//!
//! The list starts as the identity permutation over the bank and is rebuilt
//! at every window boundary, so DATA packets decode independently given the
//! DICT packet. Within a window, repeated templates collapse to position 0.

#[derive(Debug, Clone)]
pub struct MtfList {
    order: Vec<u32>,
}

impl MtfList {
    /// Identity list over ids `0..n`.
    pub fn identity(n: usize) -> Self {
        MtfList {
            order: (0..n as u32).collect(),
        }
    }

    /// Emits the current position of `id` and promotes it to the front.
    pub fn encode(&mut self, id: u32) -> Option<u64> {
        let pos = self.order.iter().position(|&x| x == id)?;
        let id = self.order.remove(pos);
        self.order.insert(0, id);
        Some(pos as u64)
    }

    /// Resolves a position back to its id and promotes it to the front.
    pub fn decode(&mut self, pos: u64) -> Option<u32> {
        if pos as usize >= self.order.len() {
            return None;
        }
        let id = self.order.remove(pos as usize);
        self.order.insert(0, id);
        Some(id)
    }
}
