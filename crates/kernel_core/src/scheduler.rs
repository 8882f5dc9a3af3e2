/// Round-robin selection over the process table.
///
/// The scan starts just after the slot selected last time and wraps
/// around once, so every ready slot is reached within one table pass.
#[derive(Debug, Default)]
pub struct Scheduler {
    last: Option<usize>,
}

impl Scheduler {
    /// Creates a scheduler that starts at slot zero.
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Returns the slot selected last.
    pub fn last(&self) -> Option<usize> {
        self.last
    }

    /// Picks the next slot in `0..len` for which `is_ready` holds.
    pub fn select(&mut self, len: usize, mut is_ready: impl FnMut(usize) -> bool) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let start = self.last.map_or(0, |last| (last + 1) % len);
        let next = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|index| is_ready(*index))?;
        self.last = Some(next);
        Some(next)
    }
}
