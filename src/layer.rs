// Sparse clockwork hierarchy - Layer (columnar encode / predict)
#![allow(clippy::needless_range_loop)]

use std::collections::VecDeque;

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::compute_system::{item_rng, ComputeSystem};
use crate::error::{Error, Result};
use crate::helpers::*;
use crate::learning::LayerParams;
use crate::projection::{inverse_columns, Window};

/// Channel 0 carries the layer's own hidden code, channel 1 the code from above.
pub const MAX_FEEDBACK_CHANNELS: usize = 2;

/// Largest grid side accepted at creation or load.
const MAX_GRID_SIDE: i32 = 1 << 14;

/// Describes one input grid of a layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibleLayerDesc {
    /// Grid size in cells.
    pub size: Int2,
    pub column_size: i32,
    /// Radius (in visible cells) of the hidden columns' receptive field.
    pub forward_radius: i32,
    /// Radius (in hidden cells) of the visible columns' feed-back field.
    pub backward_radius: i32,
    /// Predict this input. Overflow history slots set this to `false`.
    pub predict: bool,
}

impl Default for VisibleLayerDesc {
    fn default() -> Self {
        Self {
            size: Int2::new(16, 16),
            column_size: 4,
            forward_radius: 4,
            backward_radius: 4,
            predict: true,
        }
    }
}

impl VisibleLayerDesc {
    /// Grid size in columns.
    pub fn columns(&self) -> Int2 {
        Int2::new(self.size.x / self.column_size, self.size.y / self.column_size)
    }

    pub fn cells_per_column(&self) -> usize {
        (self.column_size * self.column_size) as usize
    }

    fn forward_area(&self) -> usize {
        let diam = self.forward_radius as usize * 2 + 1;
        diam * diam
    }

    fn backward_area(&self) -> usize {
        let diam = self.backward_radius as usize * 2 + 1;
        diam * diam
    }
}

pub(crate) fn validate_grid(what: &str, size: Int2, column_size: i32) -> Result<()> {
    if column_size <= 0 {
        return Err(Error::InvalidConfig(format!(
            "{what}: column size must be positive, got {column_size}"
        )));
    }

    if size.x <= 0 || size.y <= 0 || size.x > MAX_GRID_SIDE || size.y > MAX_GRID_SIDE {
        return Err(Error::InvalidConfig(format!(
            "{what}: grid size {}x{} must be in [1, {MAX_GRID_SIDE}]",
            size.x, size.y
        )));
    }

    if size.x % column_size != 0 || size.y % column_size != 0 {
        return Err(Error::InvalidConfig(format!(
            "{what}: grid size {}x{} is not divisible by column size {column_size}",
            size.x, size.y
        )));
    }

    Ok(())
}

pub(crate) fn validate_code(what: &str, code: &[i32], num_columns: usize, num_cells: usize) -> Result<()> {
    if code.len() != num_columns {
        return Err(Error::InvalidInput(format!(
            "{what}: expected {num_columns} columns, got {}",
            code.len()
        )));
    }

    if let Some((i, &ci)) = code
        .iter()
        .enumerate()
        .find(|&(_, &ci)| ci < 0 || ci as usize >= num_cells)
    {
        return Err(Error::InvalidInput(format!(
            "{what}: column {i} has cell index {ci} outside [0, {num_cells})"
        )));
    }

    Ok(())
}

/// Hidden grid geometry, in columns.
#[derive(Clone, Copy, Debug)]
struct HiddenShape {
    columns: Int2,
    column_size: i32,
}

impl HiddenShape {
    fn cells(self) -> usize {
        (self.column_size * self.column_size) as usize
    }
}

/// One stored transition for reward-driven replay.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplaySample {
    pub feedback_prev: Vec<IntBuffer>,
    pub feedback: Vec<IntBuffer>,
    /// Observed code of every visible layer when the reward arrived.
    pub actions: Vec<IntBuffer>,
    pub reward: f32,
}

/// Per-visible-layer state. Per-cell buffers are laid out `[column][cell]`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VisibleLayer {
    /// `[hidden column][hidden cell][forward offset]`
    ff_weights: FloatBuffer,
    /// `[visible column][channel][visible cell][backward offset]`, empty unless predicted.
    fb_weights: FloatBuffer,
    /// Eligibility traces, shaped like `fb_weights` once reward-driven learning runs.
    traces: FloatBuffer,
    inputs: IntBuffer,
    inputs_prev: IntBuffer,
    predictions: IntBuffer,
    recon_sums: FloatBuffer,
    recon_counts: FloatBuffer,
    recon_sums_prev: FloatBuffer,
    recon_counts_prev: FloatBuffer,
    pred_acts: FloatBuffer,
    pred_acts_prev: FloatBuffer,
}

impl VisibleLayer {
    pub fn get_inputs(&self) -> &[i32] {
        &self.inputs
    }

    pub fn get_inputs_prev(&self) -> &[i32] {
        &self.inputs_prev
    }

    pub fn get_predictions(&self) -> &[i32] {
        &self.predictions
    }

    pub fn get_ff_weights(&self) -> &[f32] {
        &self.ff_weights
    }

    pub fn get_fb_weights(&self) -> &[f32] {
        &self.fb_weights
    }

    pub fn get_traces(&self) -> &[f32] {
        &self.traces
    }

    /// Count-normalized predicted activation per visible cell.
    pub fn get_pred_acts(&self) -> &[f32] {
        &self.pred_acts
    }

    pub fn get_recon_sums(&self) -> &[f32] {
        &self.recon_sums
    }

    pub fn get_recon_counts(&self) -> &[f32] {
        &self.recon_counts
    }

    fn clear_state(&mut self) {
        self.inputs.fill(0);
        self.inputs_prev.fill(0);
        self.predictions.fill(0);
        self.recon_sums.fill(0.0);
        self.recon_counts.fill(0.0);
        self.recon_sums_prev.fill(0.0);
        self.recon_counts_prev.fill(0.0);
        self.pred_acts.fill(0.0);
        self.pred_acts_prev.fill(0.0);
        self.traces.fill(0.0);
    }
}

// --- Work items ---

struct EncodeView<'a> {
    desc: &'a VisibleLayerDesc,
    inputs: &'a [i32],
    inputs_prev: &'a [i32],
    recon_sums_prev: &'a [f32],
    recon_counts_prev: &'a [f32],
}

struct EncodeContext<'a> {
    shape: HiddenShape,
    views: Vec<EncodeView<'a>>,
    learn: bool,
    params: &'a LayerParams,
}

struct EncodeItem<'a> {
    column: usize,
    hidden_ci: &'a mut i32,
    hidden_ci_prev: i32,
    /// This column's feed-forward chunk of every visible layer.
    weights: Vec<&'a mut [f32]>,
}

impl EncodeItem<'_> {
    fn run(mut self, ctx: &EncodeContext) {
        let shape = ctx.shape;
        let column = column_pos(self.column, shape.columns);
        let num_cells = shape.cells();

        let windows: Vec<Window> = ctx
            .views
            .iter()
            .map(|view| {
                let desc = view.desc;
                Window::new(column, shape.columns, desc.columns(), desc.column_size, desc.forward_radius)
            })
            .collect();

        // Learn on the previous winner against last tick's reconstruction
        if ctx.learn {
            let prev = self.hidden_ci_prev as usize;
            let rule = ctx.params.encode_rule;
            let alpha = ctx.params.alpha;

            for ((view, window), weights) in ctx.views.iter().zip(&windows).zip(self.weights.iter_mut()) {
                let desc = view.desc;
                let visible_columns = desc.columns();
                let visible_cells = desc.cells_per_column();
                let area = window.area();
                let row = &mut weights[prev * area..(prev + 1) * area];

                for vc in window.columns() {
                    let vi = address2(vc, visible_columns);
                    let active_prev = view.inputs_prev[vi];

                    for ci in 0..visible_cells as i32 {
                        let cell = cell_pos(vc, ci, desc.column_size);

                        if !window.contains(cell) {
                            continue;
                        }

                        let wi = window.offset(cell);
                        let index = vi * visible_cells + ci as usize;
                        let target = if ci == active_prev { 1.0 } else { 0.0 };

                        row[wi] += rule.delta(
                            alpha,
                            target,
                            row[wi],
                            view.recon_sums_prev[index],
                            view.recon_counts_prev[index],
                        );
                    }
                }
            }
        }

        let mut activations = vec![0.0f32; num_cells];

        for ((view, window), weights) in ctx.views.iter().zip(&windows).zip(&self.weights) {
            let desc = view.desc;
            let visible_columns = desc.columns();
            let area = window.area();

            for vc in window.columns() {
                let ci = view.inputs[address2(vc, visible_columns)];

                if let Some(wi) = window.active_offset(vc, ci, desc.column_size) {
                    for c in 0..num_cells {
                        activations[c] += weights[c * area + wi];
                    }
                }
            }
        }

        *self.hidden_ci = argmax(&activations) as i32;
    }
}

struct ReconstructContext<'a> {
    shape: HiddenShape,
    hidden_cis: &'a [i32],
}

struct ReconstructItem<'a> {
    column: usize,
    desc: &'a VisibleLayerDesc,
    ff_weights: &'a [f32],
    sums: &'a mut [f32],
    counts: &'a mut [f32],
}

impl ReconstructItem<'_> {
    fn run(self, ctx: &ReconstructContext) {
        let shape = ctx.shape;
        let desc = self.desc;
        let visible_columns = desc.columns();
        let column = column_pos(self.column, visible_columns);
        let num_cells = shape.cells();
        let area = desc.forward_area();

        let (lower, upper) = inverse_columns(
            column,
            visible_columns,
            desc.column_size,
            shape.columns,
            desc.forward_radius,
        );

        for hx in lower.x..=upper.x {
            for hy in lower.y..=upper.y {
                let hidden_column = Int2::new(hx, hy);
                let window = Window::new(
                    hidden_column,
                    shape.columns,
                    visible_columns,
                    desc.column_size,
                    desc.forward_radius,
                );

                let hi = address2(hidden_column, shape.columns);
                let winner = ctx.hidden_cis[hi] as usize;
                let start = (hi * num_cells + winner) * area;
                let row = &self.ff_weights[start..start + area];

                for ci in 0..self.sums.len() {
                    let cell = cell_pos(column, ci as i32, desc.column_size);

                    if window.contains(cell) {
                        self.sums[ci] += row[window.offset(cell)];
                        self.counts[ci] += 1.0;
                    }
                }
            }
        }
    }
}

struct PredictContext<'a> {
    shape: HiddenShape,
    feedback: Vec<&'a [i32]>,
    feedback_prev: Vec<&'a [i32]>,
    learn: bool,
    reward: f32,
    params: &'a LayerParams,
    replay: &'a VecDeque<ReplaySample>,
    replay_picks: &'a [usize],
}

struct PredictItem<'a> {
    v: usize,
    column: usize,
    desc: &'a VisibleLayerDesc,
    /// Cell observed this tick (the target, or the action taken).
    target: i32,
    prediction: &'a mut i32,
    acts: &'a mut [f32],
    acts_prev: &'a [f32],
    weights: &'a mut [f32],
    traces: Option<&'a mut [f32]>,
    rng: Option<ChaCha20Rng>,
}

/// `(channel, offset)` of every feedback cell inside the window.
fn active_offsets<C: AsRef<[i32]>>(window: &Window, shape: HiddenShape, codes: &[C]) -> Vec<(usize, usize)> {
    let mut offsets = Vec::new();

    for (f, code) in codes.iter().enumerate() {
        let code = code.as_ref();

        for hc in window.columns() {
            let ci = code[address2(hc, shape.columns)];

            if let Some(wi) = window.active_offset(hc, ci, shape.column_size) {
                offsets.push((f, wi));
            }
        }
    }

    offsets
}

#[derive(Clone, Copy)]
struct FeedbackShape {
    num_cells: usize,
    area: usize,
}

impl FeedbackShape {
    #[inline]
    fn index(self, f: usize, c: usize, wi: usize) -> usize {
        (f * self.num_cells + c) * self.area + wi
    }

    fn value(self, weights: &[f32], offsets: &[(usize, usize)], c: usize) -> f32 {
        let sum: f32 = offsets.iter().map(|&(f, wi)| weights[self.index(f, c, wi)]).sum();
        sum / (offsets.len() as f32).max(1.0)
    }

    fn activate(self, weights: &[f32], offsets: &[(usize, usize)], acts: &mut [f32]) {
        for c in 0..self.num_cells {
            acts[c] = self.value(weights, offsets, c);
        }
    }
}

impl PredictItem<'_> {
    fn run(mut self, ctx: &PredictContext) {
        let shape = ctx.shape;
        let desc = self.desc;
        let visible_columns = desc.columns();
        let column = column_pos(self.column, visible_columns);

        let window = Window::new(column, visible_columns, shape.columns, shape.column_size, desc.backward_radius);

        let fs = FeedbackShape {
            num_cells: desc.cells_per_column(),
            area: window.area(),
        };

        let current = active_offsets(&window, shape, &ctx.feedback);
        let previous = active_offsets(&window, shape, &ctx.feedback_prev);

        if ctx.params.predict_rule.is_reward_driven() {
            self.run_td(ctx, &window, fs, &current, &previous);
            return;
        }

        let target = self.target as usize;

        if ctx.learn {
            let rule = ctx.params.predict_rule;
            let beta = ctx.params.beta;

            for c in 0..fs.num_cells {
                let t = if c == target { 1.0 } else { 0.0 };

                for &(f, wi) in &previous {
                    let i = fs.index(f, c, wi);
                    self.weights[i] += rule.delta(beta, t, self.weights[i], self.acts_prev[c]);
                }
            }
        }

        fs.activate(self.weights, &current, self.acts);

        *self.prediction = argmax(self.acts) as i32;
    }

    fn run_td(
        &mut self,
        ctx: &PredictContext,
        window: &Window,
        fs: FeedbackShape,
        current: &[(usize, usize)],
        previous: &[(usize, usize)],
    ) {
        let td = &ctx.params.td;
        let beta = ctx.params.beta;
        let action = self.target as usize;

        fs.activate(self.weights, current, self.acts);

        if ctx.learn {
            let q_next = self.acts.iter().copied().fold(LIMIT_MIN, f32::max);
            let td_error = ctx.reward + td.gamma * q_next - self.acts_prev[action];

            if let Some(traces) = self.traces.as_deref_mut() {
                let decay = td.gamma * td.lambda;

                for t in traces.iter_mut() {
                    *t *= decay;

                    if t.abs() < td.trace_cutoff {
                        *t = 0.0;
                    }
                }

                for &(f, wi) in previous {
                    traces[fs.index(f, action, wi)] = 1.0;
                }

                for (w, &t) in self.weights.iter_mut().zip(traces.iter()) {
                    if t != 0.0 {
                        *w += beta * td_error * t;
                    }
                }
            }

            for &pick in ctx.replay_picks {
                let sample = &ctx.replay[pick];
                let sample_prev = active_offsets(window, ctx.shape, &sample.feedback_prev);
                let sample_next = active_offsets(window, ctx.shape, &sample.feedback);
                let sample_action = sample.actions[self.v][self.column] as usize;

                let q_max = (0..fs.num_cells)
                    .map(|c| fs.value(self.weights, &sample_next, c))
                    .fold(LIMIT_MIN, f32::max);
                let q = fs.value(self.weights, &sample_prev, sample_action);
                let error = sample.reward + td.gamma * q_max - q;

                for &(f, wi) in &sample_prev {
                    self.weights[fs.index(f, sample_action, wi)] += beta * error;
                }
            }

            fs.activate(self.weights, current, self.acts);
        }

        let greedy = argmax(self.acts) as i32;

        // Epsilon-greedy
        *self.prediction = match self.rng.as_mut() {
            Some(rng) => {
                if rng.gen::<f32>() < td.epsilon {
                    rng.gen_range(0..fs.num_cells) as i32
                } else {
                    greedy
                }
            }
            None => greedy,
        };
    }
}

fn random_weights(len: usize, chunk: usize, base: u64) -> FloatBuffer {
    let dist = Uniform::new(INIT_WEIGHT_LOW, INIT_WEIGHT_HIGH);
    let mut weights = vec![0.0f32; len];

    weights.par_chunks_mut(chunk).enumerate().for_each(|(i, chunk)| {
        let mut rng = item_rng(base, i);

        for w in chunk.iter_mut() {
            *w = dist.sample(&mut rng);
        }
    });

    weights
}

/// One hidden grid of competitive columns with its feed-forward and
/// feed-back weights.
#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    hidden_size: Int2,
    column_size: i32,
    hidden_cis: IntBuffer,
    hidden_cis_prev: IntBuffer,
    feedback_cis: Vec<IntBuffer>,
    feedback_cis_prev: Vec<IntBuffer>,
    visible_layers: Vec<VisibleLayer>,
    visible_layer_descs: Vec<VisibleLayerDesc>,
    replay: VecDeque<ReplaySample>,
}

impl Layer {
    /// Build a layer with weights drawn uniformly from `[-0.01, 0)`.
    ///
    /// - `hidden_size` is in cells and must be divisible by `column_size`.
    /// - `num_feedback` is the number of feed-back channels (0 to 2).
    pub fn create(
        hidden_size: Int2,
        column_size: i32,
        num_feedback: usize,
        visible_layer_descs: Vec<VisibleLayerDesc>,
        seed: u64,
    ) -> Result<Self> {
        let mut layer = Self::allocate(hidden_size, column_size, num_feedback, visible_layer_descs)?;

        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let hidden_cells = layer.hidden_shape().cells();

        for (vl, desc) in layer.visible_layers.iter_mut().zip(&layer.visible_layer_descs) {
            vl.ff_weights = random_weights(vl.ff_weights.len(), hidden_cells * desc.forward_area(), rng.gen());

            if !vl.fb_weights.is_empty() {
                let chunk = num_feedback * desc.cells_per_column() * desc.backward_area();
                vl.fb_weights = random_weights(vl.fb_weights.len(), chunk, rng.gen());
            }
        }

        log::debug!(
            "layer created: hidden {}x{} (column size {}), {} visible layers, {} feedback channels",
            hidden_size.x,
            hidden_size.y,
            column_size,
            layer.visible_layers.len(),
            num_feedback
        );

        Ok(layer)
    }

    /// Validate descriptors and size every buffer, with zeroed weights.
    fn allocate(
        hidden_size: Int2,
        column_size: i32,
        num_feedback: usize,
        visible_layer_descs: Vec<VisibleLayerDesc>,
    ) -> Result<Self> {
        validate_grid("hidden layer", hidden_size, column_size)?;

        if num_feedback > MAX_FEEDBACK_CHANNELS {
            return Err(Error::InvalidConfig(format!(
                "at most {MAX_FEEDBACK_CHANNELS} feedback channels are supported, got {num_feedback}"
            )));
        }

        if visible_layer_descs.is_empty() {
            return Err(Error::InvalidConfig(
                "a layer needs at least one visible layer".to_string(),
            ));
        }

        let shape = HiddenShape {
            columns: Int2::new(hidden_size.x / column_size, hidden_size.y / column_size),
            column_size,
        };

        let num_hidden_columns = shape.columns.area();
        let mut total_weights = 0u64;

        for (v, desc) in visible_layer_descs.iter().enumerate() {
            validate_grid(&format!("visible layer {v}"), desc.size, desc.column_size)?;

            let radius_ok = |r: i32| (0..=MAX_GRID_SIDE).contains(&r);

            if !radius_ok(desc.forward_radius) || !radius_ok(desc.backward_radius) {
                return Err(Error::InvalidConfig(format!(
                    "visible layer {v}: radii must be in [0, {MAX_GRID_SIDE}], got {} / {}",
                    desc.forward_radius, desc.backward_radius
                )));
            }

            total_weights += (num_hidden_columns * shape.cells()) as u64 * desc.forward_area() as u64;
            total_weights += (desc.size.area() * num_feedback) as u64 * desc.backward_area() as u64;
        }

        if total_weights > MAX_STREAM_ELEMENTS as u64 {
            return Err(Error::InvalidConfig(format!(
                "layer would hold {total_weights} weights, limit is {MAX_STREAM_ELEMENTS}"
            )));
        }

        let visible_layers = visible_layer_descs
            .iter()
            .map(|desc| {
                let num_columns = desc.columns().area();
                let num_cells = desc.size.area();
                let predicted = desc.predict && num_feedback > 0;

                VisibleLayer {
                    ff_weights: vec![0.0; num_hidden_columns * shape.cells() * desc.forward_area()],
                    fb_weights: if predicted {
                        vec![0.0; num_cells * num_feedback * desc.backward_area()]
                    } else {
                        Vec::new()
                    },
                    traces: Vec::new(),
                    inputs: vec![0; num_columns],
                    inputs_prev: vec![0; num_columns],
                    predictions: vec![0; num_columns],
                    recon_sums: vec![0.0; num_cells],
                    recon_counts: vec![0.0; num_cells],
                    recon_sums_prev: vec![0.0; num_cells],
                    recon_counts_prev: vec![0.0; num_cells],
                    pred_acts: vec![0.0; num_cells],
                    pred_acts_prev: vec![0.0; num_cells],
                }
            })
            .collect();

        Ok(Self {
            hidden_size,
            column_size,
            hidden_cis: vec![0; num_hidden_columns],
            hidden_cis_prev: vec![0; num_hidden_columns],
            feedback_cis: vec![vec![0; num_hidden_columns]; num_feedback],
            feedback_cis_prev: vec![vec![0; num_hidden_columns]; num_feedback],
            visible_layers,
            visible_layer_descs,
            replay: VecDeque::new(),
        })
    }

    fn hidden_shape(&self) -> HiddenShape {
        HiddenShape {
            columns: self.get_hidden_columns(),
            column_size: self.column_size,
        }
    }

    /// Forward pass: compute a new hidden code from one code per visible layer.
    ///
    /// With `learn`, each column first moves its previous winner's weights
    /// toward last tick's input. Afterwards the reconstruction accumulators
    /// are rebuilt from the new winners.
    pub fn encode(
        &mut self,
        cs: &mut ComputeSystem,
        inputs: &[&[i32]],
        learn: bool,
        params: &LayerParams,
    ) -> Result<()> {
        if inputs.len() != self.visible_layers.len() {
            return Err(Error::InvalidInput(format!(
                "expected {} input codes, got {}",
                self.visible_layers.len(),
                inputs.len()
            )));
        }

        for (v, (input, desc)) in inputs.iter().zip(&self.visible_layer_descs).enumerate() {
            validate_code(
                &format!("visible layer {v}"),
                input,
                desc.columns().area(),
                desc.cells_per_column(),
            )?;
        }

        for (vl, input) in self.visible_layers.iter_mut().zip(inputs) {
            std::mem::swap(&mut vl.inputs, &mut vl.inputs_prev);
            vl.inputs.copy_from_slice(input);

            std::mem::swap(&mut vl.recon_sums, &mut vl.recon_sums_prev);
            std::mem::swap(&mut vl.recon_counts, &mut vl.recon_counts_prev);
            vl.recon_sums.fill(0.0);
            vl.recon_counts.fill(0.0);
        }

        self.hidden_cis_prev.copy_from_slice(&self.hidden_cis);

        let shape = self.hidden_shape();

        // Forward: one item per hidden column, each owning its weight chunks
        {
            let mut chunk_iters = Vec::with_capacity(self.visible_layers.len());
            let mut views = Vec::with_capacity(self.visible_layers.len());

            for (vl, desc) in self.visible_layers.iter_mut().zip(&self.visible_layer_descs) {
                let VisibleLayer {
                    ff_weights,
                    inputs,
                    inputs_prev,
                    recon_sums_prev,
                    recon_counts_prev,
                    ..
                } = vl;

                chunk_iters.push(ff_weights.chunks_mut(shape.cells() * desc.forward_area()));
                views.push(EncodeView {
                    desc,
                    inputs,
                    inputs_prev,
                    recon_sums_prev,
                    recon_counts_prev,
                });
            }

            let items: Vec<EncodeItem> = self
                .hidden_cis
                .iter_mut()
                .zip(&self.hidden_cis_prev)
                .enumerate()
                .map(|(column, (hidden_ci, &hidden_ci_prev))| EncodeItem {
                    column,
                    hidden_ci,
                    hidden_ci_prev,
                    weights: chunk_iters.iter_mut().filter_map(Iterator::next).collect(),
                })
                .collect();

            let ctx = EncodeContext {
                shape,
                views,
                learn,
                params,
            };
            let ctx = &ctx;

            cs.pool.scope(|s| {
                for item in items {
                    s.submit(move || item.run(ctx));
                }
            });
        }

        // Reconstruction: one item per visible column
        {
            let mut items = Vec::new();

            for (vl, desc) in self.visible_layers.iter_mut().zip(&self.visible_layer_descs) {
                let VisibleLayer {
                    ff_weights,
                    recon_sums,
                    recon_counts,
                    ..
                } = vl;

                let ff_weights: &[f32] = ff_weights;
                let num_cells = desc.cells_per_column();

                for (column, (sums, counts)) in recon_sums
                    .chunks_mut(num_cells)
                    .zip(recon_counts.chunks_mut(num_cells))
                    .enumerate()
                {
                    items.push(ReconstructItem {
                        column,
                        desc,
                        ff_weights,
                        sums,
                        counts,
                    });
                }
            }

            let ctx = ReconstructContext {
                shape,
                hidden_cis: &self.hidden_cis,
            };
            let ctx = &ctx;

            cs.pool.scope(|s| {
                for item in items {
                    s.submit(move || item.run(ctx));
                }
            });
        }

        Ok(())
    }

    /// Backward pass: predict every flagged visible layer from the feedback
    /// channels (one code per channel, shaped like the hidden grid).
    ///
    /// With `learn`, weights first learn from the previous tick's feedback
    /// against the code observed in the last [`encode`](Self::encode).
    /// `reward` is only read by the reward-driven rule.
    pub fn predict(
        &mut self,
        cs: &mut ComputeSystem,
        feedback: &[&[i32]],
        learn: bool,
        reward: f32,
        params: &LayerParams,
    ) -> Result<()> {
        let num_feedback = self.feedback_cis.len();

        if feedback.len() != num_feedback {
            return Err(Error::InvalidInput(format!(
                "expected {num_feedback} feedback codes, got {}",
                feedback.len()
            )));
        }

        let shape = self.hidden_shape();

        for (f, code) in feedback.iter().enumerate() {
            validate_code(&format!("feedback channel {f}"), code, shape.columns.area(), shape.cells())?;
        }

        for (f, code) in feedback.iter().enumerate() {
            std::mem::swap(&mut self.feedback_cis[f], &mut self.feedback_cis_prev[f]);
            self.feedback_cis[f].copy_from_slice(code);
        }

        if num_feedback == 0 {
            return Ok(());
        }

        let reward_driven = params.predict_rule.is_reward_driven();

        for (vl, desc) in self.visible_layers.iter_mut().zip(&self.visible_layer_descs) {
            if !desc.predict {
                continue;
            }

            std::mem::swap(&mut vl.pred_acts, &mut vl.pred_acts_prev);

            if reward_driven && vl.traces.is_empty() {
                vl.traces = vec![0.0; vl.fb_weights.len()];
            }
        }

        let base_seed = cs.pass_seed();

        let replay_picks: Vec<usize> = if reward_driven && learn && !self.replay.is_empty() {
            (0..params.td.replay_iters)
                .map(|_| cs.rng.gen_range(0..self.replay.len()))
                .collect()
        } else {
            Vec::new()
        };

        {
            let mut items = Vec::new();

            for (v, (vl, desc)) in self
                .visible_layers
                .iter_mut()
                .zip(&self.visible_layer_descs)
                .enumerate()
            {
                if !desc.predict {
                    continue;
                }

                let VisibleLayer {
                    fb_weights,
                    traces,
                    inputs,
                    predictions,
                    pred_acts,
                    pred_acts_prev,
                    ..
                } = vl;

                let num_cells = desc.cells_per_column();
                let chunk = num_feedback * num_cells * desc.backward_area();

                let mut trace_chunks = if reward_driven {
                    Some(traces.chunks_mut(chunk))
                } else {
                    None
                };

                let columns = predictions
                    .iter_mut()
                    .zip(inputs.iter())
                    .zip(pred_acts.chunks_mut(num_cells))
                    .zip(pred_acts_prev.chunks(num_cells))
                    .zip(fb_weights.chunks_mut(chunk))
                    .enumerate();

                for (column, ((((prediction, &target), acts), acts_prev), weights)) in columns {
                    let rng = reward_driven.then(|| item_rng(base_seed, items.len()));

                    items.push(PredictItem {
                        v,
                        column,
                        desc,
                        target,
                        prediction,
                        acts,
                        acts_prev,
                        weights,
                        traces: trace_chunks.as_mut().and_then(Iterator::next),
                        rng,
                    });
                }
            }

            let ctx = PredictContext {
                shape,
                feedback: self.feedback_cis.iter().map(Vec::as_slice).collect(),
                feedback_prev: self.feedback_cis_prev.iter().map(Vec::as_slice).collect(),
                learn,
                reward,
                params,
                replay: &self.replay,
                replay_picks: &replay_picks,
            };
            let ctx = &ctx;

            cs.pool.scope(|s| {
                for item in items {
                    s.submit(move || item.run(ctx));
                }
            });
        }

        if reward_driven && learn {
            self.replay.push_back(ReplaySample {
                feedback_prev: self.feedback_cis_prev.clone(),
                feedback: self.feedback_cis.clone(),
                actions: self.visible_layers.iter().map(|vl| vl.inputs.clone()).collect(),
                reward,
            });

            while self.replay.len() > params.td.max_replay_samples {
                self.replay.pop_front();
            }
        }

        Ok(())
    }

    /// Decode the latest reconstruction of visible layer `v` into a code.
    pub fn reconstruct(&self, v: usize) -> IntBuffer {
        let num_cells = self.visible_layer_descs[v].cells_per_column();

        self.get_reconstruction(v)
            .chunks(num_cells)
            .map(|column| argmax(column) as i32)
            .collect()
    }

    /// Count-normalized reconstruction of visible layer `v`, per cell.
    pub fn get_reconstruction(&self, v: usize) -> FloatBuffer {
        let vl = &self.visible_layers[v];

        vl.recon_sums
            .iter()
            .zip(&vl.recon_counts)
            .map(|(&sum, &count)| sum / count.max(1.0))
            .collect()
    }

    /// Zero codes, accumulators, traces and replay. Weights are kept.
    pub fn clear_state(&mut self) {
        self.hidden_cis.fill(0);
        self.hidden_cis_prev.fill(0);

        for (code, code_prev) in self.feedback_cis.iter_mut().zip(&mut self.feedback_cis_prev) {
            code.fill(0);
            code_prev.fill(0);
        }

        for vl in &mut self.visible_layers {
            vl.clear_state();
        }

        self.replay.clear();
    }

    // --- Accessors ---

    pub fn get_hidden_cis(&self) -> &[i32] {
        &self.hidden_cis
    }

    pub fn get_hidden_cis_prev(&self) -> &[i32] {
        &self.hidden_cis_prev
    }

    /// Hidden grid size in cells.
    pub fn get_hidden_size(&self) -> Int2 {
        self.hidden_size
    }

    pub fn get_column_size(&self) -> i32 {
        self.column_size
    }

    /// Hidden grid size in columns.
    pub fn get_hidden_columns(&self) -> Int2 {
        Int2::new(self.hidden_size.x / self.column_size, self.hidden_size.y / self.column_size)
    }

    pub fn get_num_visible_layers(&self) -> usize {
        self.visible_layers.len()
    }

    pub fn get_num_feedback(&self) -> usize {
        self.feedback_cis.len()
    }

    pub fn get_visible_layer(&self, v: usize) -> &VisibleLayer {
        &self.visible_layers[v]
    }

    pub fn get_visible_layer_desc(&self, v: usize) -> &VisibleLayerDesc {
        &self.visible_layer_descs[v]
    }

    pub fn get_predictions(&self, v: usize) -> &[i32] {
        &self.visible_layers[v].predictions
    }

    pub fn get_feedback_cis(&self, f: usize) -> &[i32] {
        &self.feedback_cis[f]
    }

    pub fn get_replay_len(&self) -> usize {
        self.replay.len()
    }

    // --- Serialization ---

    /// Descriptors and all codes, accumulators and activations.
    pub fn write_state(&self, writer: &mut dyn StreamWriter) -> Result<()> {
        writer.write_int2(self.hidden_size)?;
        writer.write_i32(self.column_size)?;
        writer.write_u32(self.feedback_cis.len() as u32)?;
        writer.write_u32(self.visible_layers.len() as u32)?;

        for desc in &self.visible_layer_descs {
            writer.write_int2(desc.size)?;
            writer.write_i32(desc.column_size)?;
            writer.write_i32(desc.forward_radius)?;
            writer.write_i32(desc.backward_radius)?;
            writer.write_u8(desc.predict as u8)?;
        }

        writer.write_i32_slice(&self.hidden_cis)?;
        writer.write_i32_slice(&self.hidden_cis_prev)?;

        for (code, code_prev) in self.feedback_cis.iter().zip(&self.feedback_cis_prev) {
            writer.write_i32_slice(code)?;
            writer.write_i32_slice(code_prev)?;
        }

        for vl in &self.visible_layers {
            writer.write_i32_slice(&vl.inputs)?;
            writer.write_i32_slice(&vl.inputs_prev)?;
            writer.write_i32_slice(&vl.predictions)?;
            writer.write_f32_slice(&vl.recon_sums)?;
            writer.write_f32_slice(&vl.recon_counts)?;
            writer.write_f32_slice(&vl.recon_sums_prev)?;
            writer.write_f32_slice(&vl.recon_counts_prev)?;
            writer.write_f32_slice(&vl.pred_acts)?;
            writer.write_f32_slice(&vl.pred_acts_prev)?;
        }

        Ok(())
    }

    /// Every weight tensor, eligibility traces and the replay buffer.
    pub fn write_weights(&self, writer: &mut dyn StreamWriter) -> Result<()> {
        for vl in &self.visible_layers {
            writer.write_f32_slice(&vl.ff_weights)?;
            writer.write_f32_slice(&vl.fb_weights)?;
            writer.write_u8(!vl.traces.is_empty() as u8)?;
            writer.write_f32_slice(&vl.traces)?;
        }

        writer.write_u32(self.replay.len() as u32)?;

        for sample in &self.replay {
            for (code, code_prev) in sample.feedback.iter().zip(&sample.feedback_prev) {
                writer.write_i32_slice(code)?;
                writer.write_i32_slice(code_prev)?;
            }

            for actions in &sample.actions {
                writer.write_i32_slice(actions)?;
            }

            writer.write_f32(sample.reward)?;
        }

        Ok(())
    }

    /// Counterpart of [`write_state`](Self::write_state). Weights are zeroed
    /// until [`read_weights`](Self::read_weights).
    pub fn read_state(reader: &mut dyn StreamReader) -> Result<Self> {
        let hidden_size = reader.read_int2()?;
        let column_size = reader.read_i32()?;
        let num_feedback = reader.read_u32()? as usize;
        let num_visible_layers = reader.read_u32()? as usize;

        if num_visible_layers > MAX_STREAM_ELEMENTS / 1024 {
            return Err(Error::InvalidFormat(format!(
                "implausible visible layer count {num_visible_layers}"
            )));
        }

        let mut descs = Vec::with_capacity(num_visible_layers);

        for _ in 0..num_visible_layers {
            let size = reader.read_int2()?;
            let column_size = reader.read_i32()?;
            let forward_radius = reader.read_i32()?;
            let backward_radius = reader.read_i32()?;
            let predict = read_flag(reader)?;

            descs.push(VisibleLayerDesc {
                size,
                column_size,
                forward_radius,
                backward_radius,
                predict,
            });
        }

        let mut layer = Self::allocate(hidden_size, column_size, num_feedback, descs)?;

        let shape = layer.hidden_shape();

        read_code(reader, "hidden code", &mut layer.hidden_cis, shape.cells())?;
        read_code(reader, "previous hidden code", &mut layer.hidden_cis_prev, shape.cells())?;

        for (code, code_prev) in layer.feedback_cis.iter_mut().zip(&mut layer.feedback_cis_prev) {
            read_code(reader, "feedback code", code, shape.cells())?;
            read_code(reader, "previous feedback code", code_prev, shape.cells())?;
        }

        for (vl, desc) in layer.visible_layers.iter_mut().zip(&layer.visible_layer_descs) {
            let num_cells = desc.cells_per_column();

            read_code(reader, "input code", &mut vl.inputs, num_cells)?;
            read_code(reader, "previous input code", &mut vl.inputs_prev, num_cells)?;
            read_code(reader, "prediction", &mut vl.predictions, num_cells)?;
            reader.read_f32_slice(&mut vl.recon_sums)?;
            reader.read_f32_slice(&mut vl.recon_counts)?;
            reader.read_f32_slice(&mut vl.recon_sums_prev)?;
            reader.read_f32_slice(&mut vl.recon_counts_prev)?;
            reader.read_f32_slice(&mut vl.pred_acts)?;
            reader.read_f32_slice(&mut vl.pred_acts_prev)?;
        }

        Ok(layer)
    }

    pub fn read_weights(&mut self, reader: &mut dyn StreamReader) -> Result<()> {
        for vl in &mut self.visible_layers {
            reader.read_f32_slice(&mut vl.ff_weights)?;
            reader.read_f32_slice(&mut vl.fb_weights)?;

            vl.traces = if read_flag(reader)? {
                vec![0.0; vl.fb_weights.len()]
            } else {
                Vec::new()
            };
            reader.read_f32_slice(&mut vl.traces)?;
        }

        let num_samples = reader.read_u32()? as usize;

        if num_samples > MAX_STREAM_ELEMENTS / 1024 {
            return Err(Error::InvalidFormat(format!(
                "implausible replay buffer length {num_samples}"
            )));
        }

        let shape = self.hidden_shape();
        self.replay.clear();

        for _ in 0..num_samples {
            let mut feedback = Vec::with_capacity(self.feedback_cis.len());
            let mut feedback_prev = Vec::with_capacity(self.feedback_cis.len());

            for _ in 0..self.feedback_cis.len() {
                let mut code = vec![0; shape.columns.area()];
                let mut code_prev = vec![0; shape.columns.area()];
                read_code(reader, "replay feedback", &mut code, shape.cells())?;
                read_code(reader, "replay feedback", &mut code_prev, shape.cells())?;
                feedback.push(code);
                feedback_prev.push(code_prev);
            }

            let mut actions = Vec::with_capacity(self.visible_layers.len());

            for desc in &self.visible_layer_descs {
                let mut code = vec![0; desc.columns().area()];
                read_code(reader, "replay action", &mut code, desc.cells_per_column())?;
                actions.push(code);
            }

            let reward = reader.read_f32()?;

            self.replay.push_back(ReplaySample {
                feedback_prev,
                feedback,
                actions,
                reward,
            });
        }

        Ok(())
    }
}

pub(crate) fn read_flag(reader: &mut dyn StreamReader) -> Result<bool> {
    match reader.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Error::InvalidFormat(format!("expected a 0/1 flag, got {other}"))),
    }
}

fn read_code(reader: &mut dyn StreamReader, what: &str, code: &mut [i32], num_cells: usize) -> Result<()> {
    reader.read_i32_slice(code)?;

    validate_code(what, code, code.len(), num_cells).map_err(|e| match e {
        Error::InvalidInput(msg) => Error::InvalidFormat(msg),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::{EncodeRule, PredictRule};

    fn single_column_layer(seed: u64) -> Layer {
        let desc = VisibleLayerDesc {
            size: Int2::new(2, 2),
            column_size: 2,
            forward_radius: 1,
            backward_radius: 1,
            predict: true,
        };

        Layer::create(Int2::new(2, 2), 2, 1, vec![desc], seed).unwrap()
    }

    #[test]
    fn create_rejects_bad_descriptors() {
        let bad_grid = VisibleLayerDesc {
            size: Int2::new(6, 6),
            column_size: 4,
            ..Default::default()
        };
        assert!(matches!(
            Layer::create(Int2::new(8, 8), 4, 2, vec![bad_grid], 0),
            Err(Error::InvalidConfig(_))
        ));

        assert!(matches!(
            Layer::create(Int2::new(8, 8), 4, 3, vec![VisibleLayerDesc::default()], 0),
            Err(Error::InvalidConfig(_))
        ));

        assert!(matches!(
            Layer::create(Int2::new(8, 8), 0, 2, vec![VisibleLayerDesc::default()], 0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn initial_weights_are_small_and_negative() {
        let layer = Layer::create(Int2::new(8, 8), 4, 2, vec![VisibleLayerDesc::default()], 3).unwrap();
        let vl = layer.get_visible_layer(0);

        assert!(!vl.get_fb_weights().is_empty());
        assert!(vl
            .get_ff_weights()
            .iter()
            .chain(vl.get_fb_weights())
            .all(|&w| (INIT_WEIGHT_LOW..INIT_WEIGHT_HIGH).contains(&w)));
    }

    #[test]
    fn encode_rejects_out_of_range_code() {
        let mut cs = ComputeSystem::new(2, 0);
        let mut layer = single_column_layer(1);
        let params = LayerParams::default();

        let err = layer.encode(&mut cs, &[&[4]], true, &params).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = layer.encode(&mut cs, &[&[0, 1]], true, &params).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn predicts_constant_input() {
        let mut cs = ComputeSystem::new(2, 0);
        let mut layer = single_column_layer(5);
        let params = LayerParams::default();

        for _ in 0..20 {
            layer.encode(&mut cs, &[&[3]], true, &params).unwrap();
            let hidden = layer.get_hidden_cis().to_vec();
            layer.predict(&mut cs, &[&hidden], true, 0.0, &params).unwrap();
        }

        assert_eq!(layer.get_predictions(0), &[3]);
        assert_eq!(layer.reconstruct(0), vec![3]);
    }

    #[test]
    fn hebbian_rules_predict_constant_input() {
        let mut cs = ComputeSystem::new(2, 0);
        let mut layer = single_column_layer(5);
        let params = LayerParams {
            encode_rule: EncodeRule::Hebbian,
            predict_rule: PredictRule::Hebbian,
            ..Default::default()
        };

        for _ in 0..30 {
            layer.encode(&mut cs, &[&[3]], true, &params).unwrap();
            let hidden = layer.get_hidden_cis().to_vec();
            layer.predict(&mut cs, &[&hidden], true, 0.0, &params).unwrap();
        }

        assert_eq!(layer.get_predictions(0), &[3]);
        assert_eq!(layer.reconstruct(0), vec![3]);
    }

    #[test]
    fn full_exploration_selects_every_cell() {
        let mut cs = ComputeSystem::new(2, 0);
        let mut layer = single_column_layer(3);
        let mut params = LayerParams {
            predict_rule: PredictRule::TemporalDifference,
            ..Default::default()
        };
        params.td.epsilon = 1.0;

        let mut seen = [0usize; 4];

        for _ in 0..200 {
            layer.encode(&mut cs, &[&[1]], true, &params).unwrap();
            let hidden = layer.get_hidden_cis().to_vec();
            layer.predict(&mut cs, &[&hidden], true, 0.0, &params).unwrap();

            seen[layer.get_predictions(0)[0] as usize] += 1;
        }

        assert!(seen.iter().all(|&n| n > 0), "selection counts {seen:?}");
    }

    #[test]
    fn temporal_difference_prefers_rewarded_action() {
        let mut cs = ComputeSystem::new(2, 0);
        let mut layer = single_column_layer(9);
        let mut params = LayerParams {
            predict_rule: PredictRule::TemporalDifference,
            ..Default::default()
        };
        params.td.epsilon = 0.0;

        // Actions cycle; only action 2 is rewarded
        for t in 0..2000 {
            let action = (t % 4) as i32;
            let reward = if action == 2 { 1.0 } else { 0.0 };

            layer.encode(&mut cs, &[&[action]], true, &params).unwrap();
            let hidden = layer.get_hidden_cis().to_vec();
            layer.predict(&mut cs, &[&hidden], true, reward, &params).unwrap();
        }

        assert_eq!(layer.get_predictions(0), &[2]);

        let acts = layer.get_visible_layer(0).get_pred_acts();
        assert!(acts[2] > acts[0] && acts[2] > acts[1] && acts[2] > acts[3], "q values {acts:?}");
    }

    #[test]
    fn replay_buffer_is_bounded() {
        let mut cs = ComputeSystem::new(2, 0);
        let mut layer = single_column_layer(7);
        let mut params = LayerParams {
            predict_rule: PredictRule::TemporalDifference,
            ..Default::default()
        };
        params.td.max_replay_samples = 5;

        for t in 0..12 {
            let action = [(t % 4) as i32];
            layer.encode(&mut cs, &[&action], true, &params).unwrap();
            let hidden = layer.get_hidden_cis().to_vec();
            layer.predict(&mut cs, &[&hidden], true, 1.0, &params).unwrap();

            assert!(layer.get_replay_len() <= 5);
            assert!((0..4).contains(&layer.get_predictions(0)[0]));
        }

        assert_eq!(layer.get_replay_len(), 5);
        assert_eq!(
            layer.get_visible_layer(0).get_traces().len(),
            layer.get_visible_layer(0).get_fb_weights().len()
        );
    }

    #[test]
    fn state_and_weights_round_trip() {
        let mut cs = ComputeSystem::new(1, 0);
        let mut layer = single_column_layer(11);
        let params = LayerParams::default();

        for t in 0..4 {
            layer.encode(&mut cs, &[&[t % 4]], true, &params).unwrap();
            let hidden = layer.get_hidden_cis().to_vec();
            layer.predict(&mut cs, &[&hidden], true, 0.0, &params).unwrap();
        }

        let mut buf: Vec<u8> = Vec::new();
        layer.write_state(&mut buf).unwrap();
        layer.write_weights(&mut buf).unwrap();

        let mut reader: &[u8] = &buf;
        let mut loaded = Layer::read_state(&mut reader).unwrap();
        loaded.read_weights(&mut reader).unwrap();

        assert_eq!(loaded, layer);
    }
}
