//! K-way merge of sorted index arrays.
//!
//! Used to discover the column pattern of a row as the union of many sorted column lists, both
//! during graph construction and in sparse products.

/// Up to this many arrays, the merge scans every cursor for each emitted value.
pub const SMALL_MERGE_LIMIT: usize = 16;

const MIN_TABLE_SIZE: usize = 64;
const MAX_TABLE_SIZE: usize = 1 << 16;
const VACANT: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct Head {
    value: usize,
    array: usize,
}

/// Entries at `start..` of the active set hold values `<= pivot`, entries before `start` hold
/// values `> pivot`.
#[derive(Debug, Clone, Copy)]
struct Split {
    start: usize,
    pivot: usize,
}

/// Reusable workspace for merging sorted arrays into a sorted, duplicate-free sequence.
///
/// Input arrays must be sorted ascending. They may be empty, contain internal duplicates or
/// coincide with each other. Values must be smaller than `usize::MAX`.
#[derive(Debug, Clone, Default)]
pub struct KWayMerger {
    positions: Vec<usize>,
    active: Vec<Head>,
    splits: Vec<Split>,
    pending: Vec<usize>,
    seen: Vec<usize>,
}

impl KWayMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `emit` once for every distinct value in `arrays`, in ascending order.
    pub fn merge<F: FnMut(usize)>(&mut self, arrays: &[&[usize]], emit: F) {
        match arrays {
            [] => {}
            [single] => emit_distinct(single, emit),
            _ if arrays.len() <= SMALL_MERGE_LIMIT => self.merge_few(arrays, emit),
            _ => self.merge_many(arrays, emit),
        }
    }

    /// Number of distinct values in `arrays`.
    pub fn count(&mut self, arrays: &[&[usize]]) -> usize {
        let mut count = 0;
        self.merge(arrays, |_| count += 1);
        count
    }

    /// Write the distinct values of `arrays` to the front of `output`, returning how many
    /// were written.
    ///
    /// Panics if `output` is too short.
    pub fn merge_into(&mut self, arrays: &[&[usize]], output: &mut [usize]) -> usize {
        let mut written = 0;
        self.merge(arrays, |value| {
            output[written] = value;
            written += 1;
        });
        written
    }

    /// Scan all cursors for the minimum on every step.
    ///
    /// Every step advances at least one cursor past the emitted value, so the total remaining
    /// length strictly decreases and the loop ends once all cursors reach their array ends.
    fn merge_few<F: FnMut(usize)>(&mut self, arrays: &[&[usize]], mut emit: F) {
        let positions = &mut self.positions;
        positions.clear();
        positions.resize(arrays.len(), 0);

        loop {
            let minimum = arrays
                .iter()
                .zip(positions.iter())
                .filter_map(|(array, &pos)| array.get(pos).copied())
                .min();
            let Some(minimum) = minimum else { break };
            emit(minimum);
            for (array, pos) in arrays.iter().zip(positions.iter_mut()) {
                while array.get(*pos) == Some(&minimum) {
                    *pos += 1;
                }
            }
        }
    }

    /// Merge with a partially partitioned active set.
    ///
    /// The active set holds one head per unexhausted array. A stack of splits keeps it ordered
    /// into value bands, smallest band last. Each step narrows the last band with midpoint
    /// pivots until it holds a single value, emits it and refills the arrays it came from. A
    /// small table of recently inserted values lets arrays skip values that another array already
    /// contributed; a clash in the table only costs a redundant entry, which is collapsed when the
    /// value is emitted.
    fn merge_many<F: FnMut(usize)>(&mut self, arrays: &[&[usize]], mut emit: F) {
        let total_len: usize = arrays.iter().map(|array| array.len()).sum();
        let table_size = (2 * total_len)
            .next_power_of_two()
            .clamp(MIN_TABLE_SIZE, MAX_TABLE_SIZE);
        let mask = table_size - 1;

        self.seen.clear();
        self.seen.resize(table_size, VACANT);
        self.positions.clear();
        self.positions.resize(arrays.len(), 0);
        self.active.clear();
        self.splits.clear();

        for (index, array) in arrays.iter().enumerate() {
            if let Some(value) = next_unseen(array, &mut self.positions[index], &mut self.seen, mask, None) {
                self.active.push(Head { value, array: index });
            }
        }

        while !self.active.is_empty() {
            while matches!(self.splits.last(), Some(split) if split.start >= self.active.len()) {
                self.splits.pop();
            }

            let mut lower = self.splits.last().map_or(0, |split| split.start);
            loop {
                let band = &mut self.active[lower..];
                let first = band[0].value;
                let Some(other) = band.iter().map(|head| head.value).find(|&v| v != first) else {
                    break;
                };
                let (lo, hi) = (first.min(other), first.max(other));
                // lo <= pivot < hi, so both sides of the split are non-empty
                let pivot = lo + (hi - lo) / 2;
                let mut boundary = 0;
                for k in 0..band.len() {
                    if band[k].value > pivot {
                        band.swap(k, boundary);
                        boundary += 1;
                    }
                }
                lower += boundary;
                self.splits.push(Split { start: lower, pivot });
            }

            let minimum = self.active[lower].value;
            emit(minimum);
            self.pending.clear();
            self.pending
                .extend(self.active[lower..].iter().map(|head| head.array));
            self.active.truncate(lower);

            for k in 0..self.pending.len() {
                let array = self.pending[k];
                let position = &mut self.positions[array];
                if let Some(value) = next_unseen(arrays[array], position, &mut self.seen, mask, Some(minimum)) {
                    self.insert(Head { value, array });
                }
            }
        }
    }

    fn insert(&mut self, head: Head) {
        let mut hole = self.active.len();
        self.active.push(head);
        for split in self.splits.iter_mut().rev() {
            if head.value <= split.pivot {
                break;
            }
            // Move the first entry of the band into the hole and grow the band above by one
            self.active[hole] = self.active[split.start];
            hole = split.start;
            split.start += 1;
        }
        self.active[hole] = head;
    }
}

fn emit_distinct<F: FnMut(usize)>(array: &[usize], mut emit: F) {
    let mut previous = None;
    for &value in array {
        if previous != Some(value) {
            emit(value);
            previous = Some(value);
        }
    }
}

/// Advance `position` past the next value of `array` that is above `floor` and not marked in
/// `seen`, marking and returning it.
fn next_unseen(
    array: &[usize],
    position: &mut usize,
    seen: &mut [usize],
    mask: usize,
    floor: Option<usize>,
) -> Option<usize> {
    while let Some(&value) = array.get(*position) {
        *position += 1;
        debug_assert_ne!(value, VACANT);
        if floor.map_or(false, |floor| value <= floor) {
            continue;
        }
        let slot = &mut seen[value & mask];
        if *slot != value {
            *slot = value;
            return Some(value);
        }
    }
    None
}

/// Merge sorted arrays into a new sorted, duplicate-free vector.
pub fn merge_sorted(arrays: &[&[usize]]) -> Vec<usize> {
    let mut output = Vec::new();
    KWayMerger::new().merge(arrays, |value| output.push(value));
    output
}

/// Number of distinct values in a collection of sorted arrays.
pub fn count_merged(arrays: &[&[usize]]) -> usize {
    KWayMerger::new().count(arrays)
}
