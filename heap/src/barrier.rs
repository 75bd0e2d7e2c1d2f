use object::{Address, Header, HeaderFlags};

/// Marking write barrier.
///
/// While incremental marking is active, every object that is mutated or
/// allocated is queued once. Finalization rescans the queue so edges
/// installed behind the marker are not lost.
#[derive(Debug, Default)]
pub struct WriteBarrier {
    remembered: Vec<Address>,
}

impl WriteBarrier {
    #[inline(always)]
    pub fn record(&mut self, holder: Address, header: &Header) {
        // Fast Path: Check flag loosely
        if header.has_flag(HeaderFlags::REMEMBERED) {
            return;
        }

        // Slow Path: Atomically set flag
        let prev = header.fetch_or_flags(HeaderFlags::REMEMBERED);
        if !prev.contains(HeaderFlags::REMEMBERED) {
            self.remembered.push(holder);
        }
    }

    pub fn take(&mut self) -> Vec<Address> {
        std::mem::take(&mut self.remembered)
    }

    pub fn clear(&mut self) {
        self.remembered.clear();
    }

    pub fn len(&self) -> usize {
        self.remembered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remembered.is_empty()
    }
}
