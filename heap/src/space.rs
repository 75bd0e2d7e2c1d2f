//! Paged object space.
//!
//! Objects live in fixed-size cells grouped into pages. An [`Address`] names
//! a page index and a cell offset. Evacuation moves an object to a cell on a
//! non-candidate page and leaves a forwarding cell behind until the
//! candidate page is released.

use bitflags::bitflags;
use object::{Address, HeapObject};

use crate::HeapError;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        const Used = 1 << 0;
        const EvacuationCandidate = 1 << 1;
    }
}

#[derive(Debug)]
pub enum Cell {
    Free,
    Object(HeapObject),
    /// Left behind by evacuation.
    Forwarded(Address),
}

#[derive(Debug)]
pub struct Page {
    cells: Box<[Cell]>,
    /// Free offsets, lowest on top.
    free: Vec<u32>,
    live: usize,
    flags: PageFlags,
    /// Fraction of cells occupied after the last sweep. Pages that were
    /// never swept count as full.
    occupancy: f64,
}

impl Page {
    fn new(cell_count: usize) -> Self {
        Self {
            cells: (0..cell_count).map(|_| Cell::Free).collect(),
            free: (0..cell_count as u32).rev().collect(),
            live: 0,
            flags: PageFlags::Used,
            occupancy: 1.0,
        }
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn has_room(&self) -> bool {
        !self.free.is_empty()
    }

    #[inline]
    pub fn free_cells(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn occupancy(&self) -> f64 {
        self.occupancy
    }

    #[inline]
    pub fn is_candidate(&self) -> bool {
        self.flags.contains(PageFlags::EvacuationCandidate)
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    fn place(&mut self, object: HeapObject) -> Option<u32> {
        let offset = self.free.pop()?;
        self.cells[offset as usize] = Cell::Object(object);
        self.live += 1;
        Some(offset)
    }

    /// Removes the object at `offset` without returning the cell to the
    /// free list.
    fn take(&mut self, offset: usize) -> Option<HeapObject> {
        match std::mem::replace(&mut self.cells[offset], Cell::Free) {
            Cell::Object(object) => {
                self.live -= 1;
                Some(object)
            }
            other => {
                self.cells[offset] = other;
                None
            }
        }
    }

    fn vacate(&mut self, offset: usize) -> Option<HeapObject> {
        match std::mem::replace(&mut self.cells[offset], Cell::Free) {
            Cell::Object(object) => {
                self.free.push(offset as u32);
                self.live -= 1;
                Some(object)
            }
            other => {
                self.cells[offset] = other;
                None
            }
        }
    }
}

#[derive(Debug)]
pub struct Space {
    pages: Vec<Option<Page>>,
    page_cells: usize,
    max_pages: usize,
    current: Option<usize>,
}

impl Space {
    pub fn new(page_cells: usize, max_pages: usize) -> Self {
        Self {
            pages: Vec::new(),
            page_cells,
            max_pages,
            current: None,
        }
    }

    pub fn page(&self, index: usize) -> Option<&Page> {
        self.pages.get(index)?.as_ref()
    }

    /// Open pages with their indices.
    pub fn pages(&self) -> impl Iterator<Item = (usize, &Page)> {
        self.pages
            .iter()
            .enumerate()
            .filter_map(|(index, page)| page.as_ref().map(|p| (index, p)))
    }

    pub fn page_count(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    pub fn object_count(&self) -> usize {
        self.pages().map(|(_, page)| page.live).sum()
    }

    // ── Allocation ────────────────────────────────────────────────────

    pub fn allocate(&mut self, object: HeapObject) -> Result<Address, HeapError> {
        let index = self.page_with_room().ok_or(HeapError::OutOfMemory {
            what: "object",
            requested: 1,
        })?;
        Ok(self.place(index, object))
    }

    fn place(&mut self, index: usize, object: HeapObject) -> Address {
        let Some(page) = self.pages[index].as_mut() else {
            unreachable!("page_with_room returned a released page");
        };
        let Some(offset) = page.place(object) else {
            unreachable!("page_with_room returned a full page");
        };
        Address::new(index, offset as usize)
    }

    /// A non-candidate page with a free cell, opening a new page if needed.
    fn page_with_room(&mut self) -> Option<usize> {
        if let Some(current) = self.current {
            if let Some(page) = self.page(current) {
                if page.has_room() && !page.is_candidate() {
                    return Some(current);
                }
            }
        }

        let found = self
            .pages()
            .find(|(_, page)| page.has_room() && !page.is_candidate())
            .map(|(index, _)| index);
        let index = match found {
            Some(index) => index,
            None => self.open_page()?,
        };
        self.current = Some(index);
        Some(index)
    }

    fn open_page(&mut self) -> Option<usize> {
        if let Some(index) = self.pages.iter().position(|p| p.is_none()) {
            self.pages[index] = Some(Page::new(self.page_cells));
            log::trace!("reopened page {index}");
            return Some(index);
        }
        if self.pages.len() >= self.max_pages {
            return None;
        }
        self.pages.push(Some(Page::new(self.page_cells)));
        log::trace!("opened page {}", self.pages.len() - 1);
        Some(self.pages.len() - 1)
    }

    /// Cells that allocation can still hand out without touching candidates.
    pub fn available_cells(&self) -> usize {
        let in_open_pages: usize = self
            .pages()
            .filter(|(_, page)| !page.is_candidate())
            .map(|(_, page)| page.free_cells())
            .sum();
        let unopened = self.max_pages - self.page_count();
        in_open_pages + unopened * self.page_cells
    }

    // ── Access ────────────────────────────────────────────────────────

    fn cell(&self, address: Address) -> Option<&Cell> {
        self.page(address.page())?.cells.get(address.offset())
    }

    pub fn object(&self, address: Address) -> Option<&HeapObject> {
        match self.cell(address)? {
            Cell::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn object_mut(&mut self, address: Address) -> Option<&mut HeapObject> {
        let page = self.pages.get_mut(address.page())?.as_mut()?;
        match page.cells.get_mut(address.offset())? {
            Cell::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Object the collector reached through a live edge. A miss is a
    /// dangling pointer.
    pub fn live_object(&self, address: Address) -> &HeapObject {
        match self.object(address) {
            Some(object) => object,
            None => panic!("fatal: reference to freed or moved cell {address:?}"),
        }
    }

    pub fn forwarding(&self, address: Address) -> Option<Address> {
        match self.cell(address)? {
            Cell::Forwarded(to) => Some(*to),
            _ => None,
        }
    }

    /// Follows a forwarding cell if one is present.
    #[inline]
    pub fn resolve(&self, address: Address) -> Address {
        self.forwarding(address).unwrap_or(address)
    }

    pub fn for_each_object(&self, mut f: impl FnMut(Address, &HeapObject)) {
        for (index, page) in self.pages() {
            for (offset, cell) in page.cells.iter().enumerate() {
                if let Cell::Object(object) = cell {
                    f(Address::new(index, offset), object);
                }
            }
        }
    }

    // ── Evacuation ────────────────────────────────────────────────────

    #[inline]
    pub fn is_evacuation_candidate(&self, address: Address) -> bool {
        self.page(address.page()).is_some_and(Page::is_candidate)
    }

    pub fn set_candidate(&mut self, index: usize) {
        if let Some(page) = self.pages.get_mut(index).and_then(Option::as_mut) {
            page.flags.insert(PageFlags::EvacuationCandidate);
        }
        if self.current == Some(index) {
            self.current = None;
        }
    }

    pub fn clear_candidates(&mut self) {
        for page in self.pages.iter_mut().flatten() {
            page.flags.remove(PageFlags::EvacuationCandidate);
        }
    }

    pub fn candidates(&self) -> Vec<usize> {
        self.pages()
            .filter(|(_, page)| page.is_candidate())
            .map(|(index, _)| index)
            .collect()
    }

    /// Moves the object at `from` to a non-candidate page and leaves a
    /// forwarding cell.
    pub fn evacuate(&mut self, from: Address) -> Result<Address, HeapError> {
        let target = self.page_with_room().ok_or(HeapError::OutOfMemory {
            what: "evacuation target",
            requested: 1,
        })?;
        let object = self.pages[from.page()]
            .as_mut()
            .and_then(|page| page.take(from.offset()))
            .unwrap_or_else(|| panic!("fatal: evacuating empty cell {from:?}"));
        let to = self.place(target, object);
        if let Some(page) = self.pages[from.page()].as_mut() {
            page.cells[from.offset()] = Cell::Forwarded(to);
        }
        Ok(to)
    }

    // ── Sweeping ──────────────────────────────────────────────────────

    /// Frees every white object on non-candidate pages and resets the mark
    /// state of survivors. Empty pages are released. Returns the number of
    /// objects freed.
    pub fn sweep(&mut self, on_free: &mut dyn FnMut(&HeapObject)) -> usize {
        let mut freed = 0;
        for index in 0..self.pages.len() {
            let Some(page) = self.pages[index].as_mut() else {
                continue;
            };
            if page.is_candidate() {
                continue;
            }
            for offset in 0..page.cells.len() {
                let dead = match &page.cells[offset] {
                    Cell::Object(object) if object.header.is_white() => true,
                    Cell::Object(object) => {
                        object.header.reset_mark_state();
                        false
                    }
                    _ => false,
                };
                if dead {
                    if let Some(object) = page.vacate(offset) {
                        on_free(&object);
                        freed += 1;
                    }
                }
            }
            page.occupancy = page.live as f64 / page.cells.len() as f64;
            if page.live == 0 {
                self.release(index);
            }
        }
        freed
    }

    /// Drops every candidate page. Objects still on them were not evacuated
    /// and are garbage. Returns the number of such objects.
    pub fn release_candidates(&mut self, on_free: &mut dyn FnMut(&HeapObject)) -> usize {
        let mut freed = 0;
        for index in self.candidates() {
            if let Some(page) = self.pages[index].take() {
                for cell in page.cells.iter() {
                    if let Cell::Object(object) = cell {
                        on_free(object);
                        freed += 1;
                    }
                }
                log::trace!("released evacuated page {index}");
            }
            if self.current == Some(index) {
                self.current = None;
            }
        }
        freed
    }

    fn release(&mut self, index: usize) {
        self.pages[index] = None;
        if self.current == Some(index) {
            self.current = None;
        }
    }
}
