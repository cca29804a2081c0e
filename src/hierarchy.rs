// Sparse clockwork hierarchy - Hierarchy (multi-rate orchestrator)
#![allow(clippy::needless_range_loop)]

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compute_system::ComputeSystem;
use crate::error::{Error, Result};
use crate::helpers::*;
use crate::layer::{read_flag, validate_code, validate_grid, Layer, VisibleLayerDesc, MAX_FEEDBACK_CHANNELS};
use crate::learning::{EncodeRule, LayerParams, PredictRule, TdParams};

/// Magic number written at the start of every serialised [`Hierarchy`].
/// Spells "SPHC" in ASCII.
const SERIAL_MAGIC: u32 = u32::from_le_bytes(*b"SPHC");

/// Binary format version. Increment when the serialised layout changes.
const SERIAL_VERSION: u32 = 1;

/// Upper bound on layer and input counts accepted from a stream.
const MAX_STREAM_COUNT: u32 = 4096;

/// Structural descriptor for one input.
///
/// Passed to [`Hierarchy::create`] and fixed thereafter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputDesc {
    /// Grid size in cells.
    pub size: Int2,
    pub column_size: i32,
    /// If `false`, the input is only encoded and never predicted.
    pub predict: bool,
}

impl Default for InputDesc {
    fn default() -> Self {
        Self {
            size: Int2::new(8, 8),
            column_size: 8,
            predict: true,
        }
    }
}

impl InputDesc {
    /// Grid size in columns.
    pub fn columns(&self) -> Int2 {
        Int2::new(self.size.x / self.column_size, self.size.y / self.column_size)
    }
}

/// Structural descriptor for one layer.
///
/// Passed to [`Hierarchy::create`] and fixed thereafter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerDesc {
    /// Hidden grid size in cells.
    pub size: Int2,
    pub column_size: i32,
    /// Receptive field radius from the layer below, in its cells.
    pub forward_radius: i32,
    /// Feed-back radius from this layer down to its inputs, in this layer's cells.
    pub backward_radius: i32,
    /// Ticks of the layer below between updates. Forced to `1` for layer 0.
    pub ticks_per_update: usize,
    /// Number of past codes the layer sees. Must be at least `ticks_per_update`.
    pub temporal_horizon: usize,
}

impl Default for LayerDesc {
    fn default() -> Self {
        Self {
            size: Int2::new(16, 16),
            column_size: 8,
            forward_radius: 12,
            backward_radius: 12,
            ticks_per_update: 2,
            temporal_horizon: 2,
        }
    }
}

/// Runtime hyperparameters for the entire hierarchy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    /// Per-layer parameters (indexed by layer).
    pub layers: Vec<LayerParams>,
}

/// A stack of [`Layer`]s ticking at different rates.
///
/// Layer 0 encodes the raw inputs every tick. Layer `l + 1` encodes the last
/// `temporal_horizon` codes of layer `l` once every `ticks_per_update` updates
/// of layer `l`. After encoding, every layer that updated predicts its inputs
/// top-down, using the aligned prediction of the layer above as feedback.
///
/// # Usage
/// ```rust,no_run
/// use sparse_clockwork::compute_system::ComputeSystem;
/// use sparse_clockwork::hierarchy::{Hierarchy, InputDesc, LayerDesc};
///
/// let mut cs = ComputeSystem::new(4, 0);
/// let mut h = Hierarchy::create(&vec![LayerDesc::default(); 2], &[InputDesc::default()], 123).unwrap();
///
/// h.step(&mut cs, &[&[5]], true, 0.0, None).unwrap();
/// let prediction = h.get_predictions(0);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Hierarchy {
    layers: Vec<Layer>,
    layer_descs: Vec<LayerDesc>,
    input_descs: Vec<InputDesc>,
    /// Per-layer input history. Layer 0 holds `num_inputs * horizon` slots
    /// (slot `i * horizon + t`), higher layers `horizon` slots; slot `t = 0`
    /// is the most recent.
    histories: Vec<Vec<IntBuffer>>,
    ticks: Vec<usize>,
    ticks_per_update: Vec<usize>,
    updates: Vec<bool>,
    /// Runtime hyperparameters. Adjustable between steps.
    pub params: Params,
}

fn validate_descs(layer_descs: &[LayerDesc], input_descs: &[InputDesc]) -> Result<()> {
    if layer_descs.is_empty() {
        return Err(Error::InvalidConfig("a hierarchy needs at least one layer".to_string()));
    }

    if input_descs.is_empty() {
        return Err(Error::InvalidConfig("a hierarchy needs at least one input".to_string()));
    }

    for (i, d) in input_descs.iter().enumerate() {
        validate_grid(&format!("input {i}"), d.size, d.column_size)?;
    }

    for (l, d) in layer_descs.iter().enumerate() {
        validate_grid(&format!("layer {l}"), d.size, d.column_size)?;

        if d.temporal_horizon == 0 {
            return Err(Error::InvalidConfig(format!(
                "layer {l}: temporal horizon must be at least 1"
            )));
        }

        if l > 0 {
            if d.ticks_per_update == 0 {
                return Err(Error::InvalidConfig(format!(
                    "layer {l}: ticks per update must be at least 1"
                )));
            }

            if d.temporal_horizon < d.ticks_per_update {
                return Err(Error::InvalidConfig(format!(
                    "layer {l}: temporal horizon {} is shorter than ticks per update {}",
                    d.temporal_horizon, d.ticks_per_update
                )));
            }
        }
    }

    Ok(())
}

fn ticks_per_update(layer_descs: &[LayerDesc]) -> Vec<usize> {
    layer_descs
        .iter()
        .enumerate()
        .map(|(l, d)| if l == 0 { 1 } else { d.ticks_per_update })
        .collect()
}

/// Visible layers of layer `l`: one per history slot.
fn visible_layer_descs(l: usize, layer_descs: &[LayerDesc], input_descs: &[InputDesc]) -> Vec<VisibleLayerDesc> {
    let ld = &layer_descs[l];
    let horizon = ld.temporal_horizon;

    if l == 0 {
        input_descs
            .iter()
            .flat_map(|input| {
                (0..horizon).map(move |t| VisibleLayerDesc {
                    size: input.size,
                    column_size: input.column_size,
                    forward_radius: ld.forward_radius,
                    backward_radius: ld.backward_radius,
                    predict: t == 0 && input.predict,
                })
            })
            .collect()
    } else {
        let below = &layer_descs[l - 1];

        (0..horizon)
            .map(|t| VisibleLayerDesc {
                size: below.size,
                column_size: below.column_size,
                forward_radius: ld.forward_radius,
                backward_radius: ld.backward_radius,
                predict: t < ld.ticks_per_update,
            })
            .collect()
    }
}

/// Counters start one short of the period so every layer updates on the first tick.
fn initial_ticks(ticks_per_update: &[usize]) -> Vec<usize> {
    ticks_per_update.iter().map(|&tpu| tpu - 1).collect()
}

impl Hierarchy {
    /// Build a hierarchy from structural descriptors (bottom layer first).
    ///
    /// Layer `l` is seeded with `seed + l + 1`.
    pub fn create(layer_descs: &[LayerDesc], input_descs: &[InputDesc], seed: u64) -> Result<Self> {
        validate_descs(layer_descs, input_descs)?;

        let num_layers = layer_descs.len();
        let tpu = ticks_per_update(layer_descs);

        let mut layers = Vec::with_capacity(num_layers);
        let mut histories = Vec::with_capacity(num_layers);

        for l in 0..num_layers {
            let vlds = visible_layer_descs(l, layer_descs, input_descs);

            histories.push(
                vlds.iter()
                    .map(|d| vec![0; d.columns().area()])
                    .collect::<Vec<IntBuffer>>(),
            );

            layers.push(Layer::create(
                layer_descs[l].size,
                layer_descs[l].column_size,
                MAX_FEEDBACK_CHANNELS,
                vlds,
                seed.wrapping_add(l as u64 + 1),
            )?);
        }

        log::info!(
            "hierarchy created: {} layers, {} inputs, ticks per update {:?}",
            num_layers,
            input_descs.len(),
            tpu
        );

        Ok(Self {
            layers,
            layer_descs: layer_descs.to_vec(),
            input_descs: input_descs.to_vec(),
            histories,
            ticks: initial_ticks(&tpu),
            ticks_per_update: tpu,
            updates: vec![false; num_layers],
            params: Params {
                layers: vec![LayerParams::default(); num_layers],
            },
        })
    }

    /// Run one global tick.
    ///
    /// - `inputs` - one code per input, in `InputDesc` order.
    /// - `learn` - if `false`, all weight updates are skipped.
    /// - `reward` - read by layers using the reward-driven predict rule.
    /// - `top_feedback` - feedback for the top layer; its own hidden code if `None`.
    pub fn step(
        &mut self,
        cs: &mut ComputeSystem,
        inputs: &[&[i32]],
        learn: bool,
        reward: f32,
        top_feedback: Option<&[i32]>,
    ) -> Result<()> {
        let num_layers = self.layers.len();
        let num_inputs = self.input_descs.len();

        if inputs.len() != num_inputs {
            return Err(Error::InvalidInput(format!(
                "expected {num_inputs} input codes, got {}",
                inputs.len()
            )));
        }

        for (i, (input, desc)) in inputs.iter().zip(&self.input_descs).enumerate() {
            validate_code(
                &format!("input {i}"),
                input,
                desc.columns().area(),
                (desc.column_size * desc.column_size) as usize,
            )?;
        }

        if let Some(feedback) = top_feedback {
            let top = &self.layers[num_layers - 1];
            let cs_top = top.get_column_size();

            validate_code(
                "top feedback",
                feedback,
                top.get_hidden_columns().area(),
                (cs_top * cs_top) as usize,
            )?;
        }

        if self.params.layers.len() != num_layers {
            return Err(Error::InvalidConfig(format!(
                "params hold {} layers, hierarchy has {num_layers}",
                self.params.layers.len()
            )));
        }

        // Shift the input history and insert the new codes
        let horizon = self.layer_descs[0].temporal_horizon;

        for (i, input) in inputs.iter().enumerate() {
            let slots = &mut self.histories[0][i * horizon..(i + 1) * horizon];
            slots.rotate_right(1);
            slots[0].copy_from_slice(input);
        }

        // --- Forward pass ---
        self.updates.fill(false);

        for l in 0..num_layers {
            if l != 0 && self.ticks[l] < self.ticks_per_update[l] {
                continue;
            }

            self.ticks[l] = 0;
            self.updates[l] = true;

            log::debug!("layer {l} encoding");

            let layer_inputs: Vec<&[i32]> = self.histories[l].iter().map(Vec::as_slice).collect();
            self.layers[l].encode(cs, &layer_inputs, learn, &self.params.layers[l])?;

            if l < num_layers - 1 {
                let next = &mut self.histories[l + 1];
                next.rotate_right(1);
                next[0].copy_from_slice(self.layers[l].get_hidden_cis());

                self.ticks[l + 1] += 1;
            }
        }

        // --- Backward pass ---
        for l in (0..num_layers).rev() {
            if !self.updates[l] {
                continue;
            }

            let (lower, upper) = self.layers.split_at_mut(l + 1);
            let layer = &mut lower[l];
            let own = layer.get_hidden_cis().to_vec();

            let feedback: &[i32] = if l < num_layers - 1 {
                let slot = self.ticks_per_update[l + 1] - 1 - self.ticks[l + 1];
                upper[0].get_predictions(slot)
            } else {
                top_feedback.unwrap_or(own.as_slice())
            };

            layer.predict(cs, &[own.as_slice(), feedback], learn, reward, &self.params.layers[l])?;
        }

        Ok(())
    }

    /// Reset codes, histories and tick counters. Weights are kept.
    pub fn clear_state(&mut self) {
        for layer in &mut self.layers {
            layer.clear_state();
        }

        for code in self.histories.iter_mut().flatten() {
            code.fill(0);
        }

        self.ticks = initial_ticks(&self.ticks_per_update);
        self.updates.fill(false);
    }

    // --- Accessors ---

    /// Return the prediction of the next code of input `i`.
    pub fn get_predictions(&self, i: usize) -> &[i32] {
        self.layers[0].get_predictions(i * self.layer_descs[0].temporal_horizon)
    }

    /// Return layer `l`'s prediction for its visible layer (history slot) `v`.
    pub fn get_layer_predictions(&self, l: usize, v: usize) -> &[i32] {
        self.layers[l].get_predictions(v)
    }

    /// Return the current hidden code of layer `l`.
    pub fn get_hidden_states(&self, l: usize) -> &[i32] {
        self.layers[l].get_hidden_cis()
    }

    /// Return `true` if layer `l` updated on the last step.
    pub fn get_update(&self, l: usize) -> bool {
        self.updates[l]
    }

    pub fn get_ticks(&self, l: usize) -> usize {
        self.ticks[l]
    }

    pub fn get_ticks_per_update(&self, l: usize) -> usize {
        self.ticks_per_update[l]
    }

    pub fn get_histories(&self, l: usize) -> &[IntBuffer] {
        &self.histories[l]
    }

    pub fn get_layer(&self, l: usize) -> &Layer {
        &self.layers[l]
    }

    pub fn get_layer_desc(&self, l: usize) -> &LayerDesc {
        &self.layer_descs[l]
    }

    pub fn get_input_desc(&self, i: usize) -> &InputDesc {
        &self.input_descs[i]
    }

    pub fn get_num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn get_num_inputs(&self) -> usize {
        self.input_descs.len()
    }

    // --- Serialization ---

    /// Serialise descriptors, params, tick state, every code and history,
    /// then every weight tensor.
    pub fn write(&self, writer: &mut dyn StreamWriter) -> Result<()> {
        writer.write_u32(SERIAL_MAGIC)?;
        writer.write_u32(SERIAL_VERSION)?;

        writer.write_u32(self.layers.len() as u32)?;
        writer.write_u32(self.input_descs.len() as u32)?;

        for d in &self.input_descs {
            writer.write_int2(d.size)?;
            writer.write_i32(d.column_size)?;
            writer.write_u8(d.predict as u8)?;
        }

        for l in 0..self.layers.len() {
            let d = &self.layer_descs[l];
            writer.write_int2(d.size)?;
            writer.write_i32(d.column_size)?;
            writer.write_i32(d.forward_radius)?;
            writer.write_i32(d.backward_radius)?;
            writer.write_u32(d.ticks_per_update as u32)?;
            writer.write_u32(d.temporal_horizon as u32)?;

            write_params(writer, &self.params.layers[l])?;

            writer.write_u32(self.ticks[l] as u32)?;
            writer.write_u8(self.updates[l] as u8)?;

            self.layers[l].write_state(writer)?;

            for code in &self.histories[l] {
                writer.write_i32_slice(code)?;
            }
        }

        for layer in &self.layers {
            layer.write_weights(writer)?;
        }

        Ok(())
    }

    /// Counterpart of [`write`](Self::write).
    pub fn read(reader: &mut dyn StreamReader) -> Result<Self> {
        let magic = reader.read_u32()?;

        if magic != SERIAL_MAGIC {
            return Err(Error::InvalidFormat(format!(
                "bad magic number (got {magic:#010x}, expected {SERIAL_MAGIC:#010x})"
            )));
        }

        let version = reader.read_u32()?;

        if version != SERIAL_VERSION {
            return Err(Error::InvalidFormat(format!(
                "unsupported version {version} (expected {SERIAL_VERSION})"
            )));
        }

        let num_layers = reader.read_u32()?;
        let num_inputs = reader.read_u32()?;

        if num_layers > MAX_STREAM_COUNT || num_inputs > MAX_STREAM_COUNT {
            return Err(Error::InvalidFormat(format!(
                "implausible counts: {num_layers} layers, {num_inputs} inputs"
            )));
        }

        let mut input_descs = Vec::with_capacity(num_inputs as usize);

        for _ in 0..num_inputs {
            let size = reader.read_int2()?;
            let column_size = reader.read_i32()?;
            let predict = read_flag(reader)?;

            input_descs.push(InputDesc {
                size,
                column_size,
                predict,
            });
        }

        let mut layer_descs = Vec::with_capacity(num_layers as usize);
        let mut params = Params::default();
        let mut ticks = Vec::with_capacity(num_layers as usize);
        let mut updates = Vec::with_capacity(num_layers as usize);
        let mut layers = Vec::with_capacity(num_layers as usize);
        let mut histories = Vec::with_capacity(num_layers as usize);

        for l in 0..num_layers as usize {
            layer_descs.push(LayerDesc {
                size: reader.read_int2()?,
                column_size: reader.read_i32()?,
                forward_radius: reader.read_i32()?,
                backward_radius: reader.read_i32()?,
                ticks_per_update: reader.read_u32()? as usize,
                temporal_horizon: reader.read_u32()? as usize,
            });

            if layer_descs[l].temporal_horizon > MAX_STREAM_COUNT as usize {
                return Err(Error::InvalidFormat(format!(
                    "layer {l}: implausible temporal horizon {}",
                    layer_descs[l].temporal_horizon
                )));
            }

            // Descriptors of all layers up to `l` are needed to check layer `l`
            validate_descs(&layer_descs, &input_descs)?;

            params.layers.push(read_params(reader)?);
            ticks.push(reader.read_u32()? as usize);
            updates.push(read_flag(reader)?);

            let layer = Layer::read_state(reader)?;
            let expected = visible_layer_descs(l, &layer_descs, &input_descs);

            let matches = layer.get_hidden_size() == layer_descs[l].size
                && layer.get_column_size() == layer_descs[l].column_size
                && layer.get_num_feedback() == MAX_FEEDBACK_CHANNELS
                && layer.get_num_visible_layers() == expected.len()
                && expected
                    .iter()
                    .enumerate()
                    .all(|(v, d)| layer.get_visible_layer_desc(v) == d);

            if !matches {
                return Err(Error::InvalidFormat(format!(
                    "layer {l} does not match its descriptor"
                )));
            }

            let mut history = Vec::with_capacity(expected.len());

            for d in &expected {
                let mut code = vec![0; d.columns().area()];
                reader.read_i32_slice(&mut code)?;

                validate_code("history", &code, code.len(), d.cells_per_column())
                    .map_err(|e| Error::InvalidFormat(e.to_string()))?;

                history.push(code);
            }

            histories.push(history);
            layers.push(layer);
        }

        if layers.is_empty() {
            return Err(Error::InvalidFormat("stream holds no layers".to_string()));
        }

        let tpu = ticks_per_update(&layer_descs);

        if ticks.iter().zip(&tpu).any(|(&t, &p)| t > p) {
            return Err(Error::InvalidFormat("tick counter exceeds its period".to_string()));
        }

        for layer in &mut layers {
            layer.read_weights(reader)?;
        }

        Ok(Self {
            layers,
            layer_descs,
            input_descs,
            histories,
            ticks,
            ticks_per_update: tpu,
            updates,
            params,
        })
    }

    /// Save the full state to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);

        self.write(&mut writer)?;
        writer.flush()?;

        log::info!("hierarchy saved to {}", path.display());

        Ok(())
    }

    /// Replace `self` with the state saved at `path`.
    ///
    /// On any failure `self` is left untouched.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        *self = Self::from_file(path)?;

        Ok(())
    }

    /// Read a hierarchy saved with [`save`](Self::save).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);
        let h = Self::read(&mut reader)?;

        log::info!(
            "hierarchy loaded from {}: {} layers, {} inputs",
            path.display(),
            h.get_num_layers(),
            h.get_num_inputs()
        );

        Ok(h)
    }
}

fn write_params(writer: &mut dyn StreamWriter, p: &LayerParams) -> Result<()> {
    writer.write_f32(p.alpha)?;
    writer.write_f32(p.beta)?;
    writer.write_u8(p.encode_rule.to_u8())?;
    writer.write_u8(p.predict_rule.to_u8())?;
    writer.write_f32(p.td.gamma)?;
    writer.write_f32(p.td.lambda)?;
    writer.write_f32(p.td.epsilon)?;
    writer.write_f32(p.td.trace_cutoff)?;
    writer.write_u32(p.td.max_replay_samples as u32)?;
    writer.write_u32(p.td.replay_iters as u32)?;

    Ok(())
}

fn read_count(reader: &mut dyn StreamReader, what: &str) -> Result<usize> {
    let count = reader.read_u32()?;

    if count > MAX_STREAM_COUNT {
        return Err(Error::InvalidFormat(format!("implausible {what} {count}")));
    }

    Ok(count as usize)
}

fn read_params(reader: &mut dyn StreamReader) -> Result<LayerParams> {
    let alpha = reader.read_f32()?;
    let beta = reader.read_f32()?;

    let encode_tag = reader.read_u8()?;
    let encode_rule = EncodeRule::from_u8(encode_tag)
        .ok_or_else(|| Error::InvalidFormat(format!("unknown encode rule {encode_tag}")))?;

    let predict_tag = reader.read_u8()?;
    let predict_rule = PredictRule::from_u8(predict_tag)
        .ok_or_else(|| Error::InvalidFormat(format!("unknown predict rule {predict_tag}")))?;

    let td = TdParams {
        gamma: reader.read_f32()?,
        lambda: reader.read_f32()?,
        epsilon: reader.read_f32()?,
        trace_cutoff: reader.read_f32()?,
        max_replay_samples: read_count(reader, "replay buffer capacity")?,
        replay_iters: read_count(reader, "replay iterations")?,
    };

    Ok(LayerParams {
        alpha,
        beta,
        encode_rule,
        predict_rule,
        td,
    })
}
