//! Vertex accumulation.
//!
//! Rectangles are accumulated as vertex floats and drained into the
//! command stream in batches. The accumulator tracks three counters:
//! `used` (floats written), `index` (vertices completed) and `start`
//! (first vertex of the open primitive run, so a flush can back-patch
//! the draw's vertex count and a second pass can re-issue the same
//! range).
//!
//! Positions are packed as two signed 16-bit lanes in a single 32-bit
//! vertex word; the device's vertex fetcher unpacks them as scaled
//! integers.

/// Default capacity in floats.
pub const DEFAULT_CAPACITY: usize = 16 * 1024;

/// Pack a pixel coordinate pair into one vertex word.
pub fn pack_xy(x: i16, y: i16) -> f32 {
    f32::from_bits(((y as u16 as u32) << 16) | x as u16 as u32)
}

/// Append-only float buffer with primitive-run bookkeeping.
#[derive(Debug)]
pub struct VertexAccumulator {
    data: Vec<f32>,
    used: usize,
    index: usize,
    start: usize,
    floats_per_vertex: usize,
}

impl VertexAccumulator {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity],
            used: 0,
            index: 0,
            start: 0,
            floats_per_vertex: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Floats still available before a flush is required.
    pub fn space(&self) -> usize {
        self.data.len() - self.used
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Vertices completed so far.
    pub fn index(&self) -> usize {
        self.index
    }

    /// First vertex of the open primitive run.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Vertices accumulated in the open primitive run.
    pub fn pending(&self) -> usize {
        self.index - self.start
    }

    pub fn floats_per_vertex(&self) -> usize {
        self.floats_per_vertex
    }

    /// Grow so a single request of `min_total` floats can be
    /// accumulated without flushing. Requests beyond the current
    /// capacity spill into a larger allocation instead of failing.
    pub fn grow_for(&mut self, min_total: usize) {
        if min_total > self.data.len() {
            let target = (self.data.len() * 2).max(min_total);
            self.data.resize(target, 0.0);
        }
    }

    /// Switch to a new vertex layout, realigning the vertex index to
    /// the float cursor so a stale layout's partial stride is never
    /// carried into the next draw.
    pub fn align(&mut self, floats_per_vertex: usize) {
        debug_assert!(floats_per_vertex > 0);
        if self.floats_per_vertex != floats_per_vertex {
            self.index = self.used.div_ceil(floats_per_vertex);
            self.used = self.index * floats_per_vertex;
            self.floats_per_vertex = floats_per_vertex;
            // Rounding the cursor up to the new stride may need a few
            // slack floats when the buffer was nearly full.
            if self.used > self.data.len() {
                self.data.resize(self.used, 0.0);
            }
        }
    }

    /// Mark the current vertex as the start of a new primitive run.
    pub fn start_primitive(&mut self) {
        self.start = self.index;
    }

    /// Account for `rects` rectangles about to be emitted.
    pub fn advance_rects(&mut self, rects: usize) {
        self.index += 3 * rects;
    }

    pub fn emit(&mut self, value: f32) {
        self.data[self.used] = value;
        self.used += 1;
    }

    pub fn emit_xy(&mut self, x: i16, y: i16) {
        self.emit(pack_xy(x, y));
    }

    /// Reserve `floats` slots and return them for an emitter to fill.
    pub fn alloc(&mut self, floats: usize) -> &mut [f32] {
        debug_assert!(self.used + floats <= self.data.len());
        let slice = &mut self.data[self.used..self.used + floats];
        self.used += floats;
        slice
    }

    /// The open primitive run's vertex range. The start is left in
    /// place: an uninterrupted run may keep extending the same
    /// primitive across flushes.
    pub fn primitive_range(&self) -> (usize, usize) {
        (self.start, self.index)
    }

    /// The accumulated floats, reinterpreted as command words.
    pub fn as_words(&self) -> impl Iterator<Item = u32> + '_ {
        self.data[..self.used].iter().map(|f| f.to_bits())
    }

    /// Raw bytes of the accumulated floats, for buffer-object upload.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.used * 4);
        for f in &self.data[..self.used] {
            bytes.extend_from_slice(&f.to_bits().to_le_bytes());
        }
        bytes
    }

    /// Drop all accumulated data after it has been drained.
    pub fn reset(&mut self) {
        self.used = 0;
        self.index = 0;
        self.start = 0;
    }
}

impl Default for VertexAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
