//! Declarative binding descriptors and the parameter binder.
//!
//! Every engine variant has a [`BindingDescriptor`]: a table saying which
//! node/field receives each request value and which output shapes the
//! variant produces. [`bind`] applies a descriptor to a private copy of a
//! template, so the shared cached template is never touched.
//!
//! Fields come in two kinds:
//!
//! * **required** - the node and field must exist on the template.
//!   [`BindingDescriptor::validate`] checks this when the template is
//!   loaded, and [`bind`] reports [`CoreError::Binding`] if it is violated.
//! * **gated** - only written when the node exists on the template (and,
//!   for the end image, when the request supplies one). A request asking
//!   for a gated feature the template lacks is not an error; the value is
//!   dropped and a debug line is logged.

use serde_json::json;

use crate::error::CoreError;
use crate::request::BindingRequest;
use crate::template::GraphTemplate;
use crate::variant::EngineVariant;

// ---------------------------------------------------------------------------
// Dimensions
// ---------------------------------------------------------------------------

/// Dimension granularity required by the video model.
pub const DIMENSION_MULTIPLE: f64 = 16.0;

/// Upper bound of a normalized dimension.
pub const MAX_NORMALIZED_DIMENSION: u32 = 8192;

/// Snap a dimension to the nearest multiple of 16, within
/// `16..=MAX_NORMALIZED_DIMENSION`.
///
/// Exact halves round to the even multiple (`40 -> 32`, `56 -> 64`).
/// Non-finite input yields 16.
pub fn normalize_dimension(value: f64) -> u32 {
    if !value.is_finite() {
        return DIMENSION_MULTIPLE as u32;
    }
    let snapped = (value / DIMENSION_MULTIPLE).round_ties_even() * DIMENSION_MULTIPLE;
    snapped.clamp(DIMENSION_MULTIPLE, MAX_NORMALIZED_DIMENSION as f64) as u32
}

/// Sampler step at which the high-noise stage hands over (60% of steps).
pub fn split_step(steps: u32) -> u32 {
    steps.saturating_mul(3) / 5
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// A node input addressed by node ID and field name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef {
    pub node: &'static str,
    pub field: &'static str,
}

const fn field(node: &'static str, field: &'static str) -> FieldRef {
    FieldRef { node, field }
}

impl std::fmt::Display for FieldRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node, self.field)
    }
}

/// An output shape the engine may report for a node in the history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// `gifs: [{fullpath, filename, ...}]` from video-combine nodes.
    AnimatedImages,
    /// `videos: [{fullpath?, filename, subfolder?}]`.
    Videos,
    /// `filenames: ["clip.mp4", ...]` or `[{filename, subfolder?}]`.
    Filenames,
}

impl OutputShape {
    /// Key of the list inside a node's output object.
    pub fn key(&self) -> &'static str {
        match self {
            Self::AnimatedImages => "gifs",
            Self::Videos => "videos",
            Self::Filenames => "filenames",
        }
    }
}

/// Every shape, highest precedence first.
pub const ALL_OUTPUT_SHAPES: &[OutputShape] = &[
    OutputShape::AnimatedImages,
    OutputShape::Videos,
    OutputShape::Filenames,
];

/// Where each request value goes for one engine variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDescriptor {
    pub variant: EngineVariant,
    /// File name of the template inside the template directory.
    pub template_file: &'static str,

    // required
    pub image: FieldRef,
    pub prompt: FieldRef,
    pub negative_prompt: FieldRef,
    pub width: FieldRef,
    pub height: FieldRef,
    pub frames: FieldRef,
    pub context_frames: FieldRef,
    pub context_overlap: FieldRef,
    pub cfg: FieldRef,
    pub seed: FieldRef,

    // gated
    pub end_image: Option<FieldRef>,
    /// Every input that takes the total sampler step count.
    pub steps: &'static [FieldRef],
    /// Every input that takes the high/low noise hand-over step.
    pub split_step: &'static [FieldRef],

    /// Output shapes to look for after completion, in precedence order.
    pub outputs: &'static [OutputShape],
}

const FP8: BindingDescriptor = BindingDescriptor {
    variant: EngineVariant::Fp8,
    template_file: "new_Wan22_api.json",
    image: field("244", "image"),
    prompt: field("135", "positive_prompt"),
    negative_prompt: field("135", "negative_prompt"),
    width: field("235", "value"),
    height: field("236", "value"),
    frames: field("541", "num_frames"),
    context_frames: field("498", "context_frames"),
    context_overlap: field("498", "context_overlap"),
    cfg: field("540", "cfg"),
    seed: field("540", "seed"),
    end_image: None,
    steps: &[field("834", "steps")],
    split_step: &[field("829", "step")],
    outputs: ALL_OUTPUT_SHAPES,
};

// The GGUF graph has no sigma scheduler; both samplers take the step count
// and the split point directly.
const GGUF: BindingDescriptor = BindingDescriptor {
    variant: EngineVariant::Gguf,
    template_file: "new_Wan22_gguf_api.json",
    steps: &[field("540", "steps"), field("831", "steps")],
    split_step: &[field("540", "end_step"), field("831", "start_step")],
    ..FP8
};

const FLF2V: BindingDescriptor = BindingDescriptor {
    variant: EngineVariant::Flf2v,
    template_file: "new_Wan22_flf2v_api.json",
    end_image: Some(field("617", "image")),
    ..FP8
};

impl BindingDescriptor {
    /// Descriptor for a variant.
    pub fn for_variant(variant: EngineVariant) -> &'static BindingDescriptor {
        match variant {
            EngineVariant::Fp8 => &FP8,
            EngineVariant::Gguf => &GGUF,
            EngineVariant::Flf2v => &FLF2V,
        }
    }

    fn required(&self) -> [(&'static str, FieldRef); 10] {
        [
            ("image", self.image),
            ("prompt", self.prompt),
            ("negative_prompt", self.negative_prompt),
            ("width", self.width),
            ("height", self.height),
            ("frames", self.frames),
            ("context_frames", self.context_frames),
            ("context_overlap", self.context_overlap),
            ("cfg", self.cfg),
            ("seed", self.seed),
        ]
    }

    fn gated(&self) -> impl Iterator<Item = (&'static str, FieldRef)> {
        let end_image = self.end_image.map(|f| ("end_image", f));
        let steps = self.steps.iter().map(|f| ("steps", *f));
        let split = self.split_step.iter().map(|f| ("split_step", *f));
        end_image.into_iter().chain(steps).chain(split)
    }

    /// Check a template against this descriptor.
    ///
    /// Every required field must exist. Gated nodes may be absent, but
    /// when present they must carry the field.
    pub fn validate(&self, template: &GraphTemplate) -> Result<(), CoreError> {
        for (name, target) in self.required() {
            check_field(template, name, target)?;
        }
        for (name, target) in self.gated() {
            if template.contains_node(target.node) {
                check_field(template, name, target)?;
            }
        }
        Ok(())
    }
}

fn check_field(template: &GraphTemplate, name: &str, target: FieldRef) -> Result<(), CoreError> {
    let node = template.node(target.node).ok_or_else(|| {
        CoreError::Binding(format!(
            "{} template has no node '{}' for {name}",
            template.variant(),
            target.node
        ))
    })?;
    if !node.inputs.contains_key(target.field) {
        return Err(CoreError::Binding(format!(
            "{} template node '{}' ({}) has no input '{}' for {name}",
            template.variant(),
            target.node,
            node.class_type,
            target.field
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// A template copy with request values written in, ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundGraph {
    graph: GraphTemplate,
}

impl BoundGraph {
    pub fn variant(&self) -> EngineVariant {
        self.graph.variant()
    }

    pub fn input(&self, node_id: &str, field: &str) -> Option<&serde_json::Value> {
        self.graph.input(node_id, field)
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.graph.contains_node(node_id)
    }

    /// The `prompt` body of a submission.
    pub fn to_prompt(&self) -> serde_json::Value {
        self.graph.to_prompt()
    }
}

/// Bind a request onto a template.
///
/// The template is cloned first; the argument is never mutated.
pub fn bind(template: &GraphTemplate, request: &BindingRequest) -> Result<BoundGraph, CoreError> {
    let descriptor = BindingDescriptor::for_variant(template.variant());
    let params = &request.params;
    let mut graph = template.clone();

    let width = normalize_dimension(params.width);
    let height = normalize_dimension(params.height);

    set_required(&mut graph, descriptor.image, json!(request.image))?;
    set_required(&mut graph, descriptor.prompt, json!(params.prompt))?;
    set_required(&mut graph, descriptor.negative_prompt, json!(params.negative_prompt))?;
    set_required(&mut graph, descriptor.width, json!(width))?;
    set_required(&mut graph, descriptor.height, json!(height))?;
    set_required(&mut graph, descriptor.frames, json!(params.length))?;
    set_required(&mut graph, descriptor.context_frames, json!(params.context_frames))?;
    set_required(&mut graph, descriptor.context_overlap, json!(params.context_overlap))?;
    set_required(&mut graph, descriptor.cfg, json!(params.cfg))?;
    set_required(&mut graph, descriptor.seed, json!(params.seed))?;

    let split = split_step(params.steps);
    let mut steps_applied = 0;
    for target in descriptor.steps {
        steps_applied += usize::from(set_gated(&mut graph, *target, json!(params.steps)));
    }
    for target in descriptor.split_step {
        set_gated(&mut graph, *target, json!(split));
    }
    if steps_applied == 0 {
        tracing::warn!(
            variant = %template.variant(),
            steps = params.steps,
            "Template has no step-count input, template default used",
        );
    }

    if let Some(end_image) = &request.end_image {
        let applied = descriptor
            .end_image
            .map(|target| set_gated(&mut graph, target, json!(end_image)))
            .unwrap_or(false);
        if !applied {
            tracing::debug!(
                variant = %template.variant(),
                "Template has no end-image node, end image ignored",
            );
        }
    }

    tracing::debug!(
        variant = %template.variant(),
        width,
        height,
        frames = params.length,
        steps = params.steps,
        seed = params.seed,
        "Bound request onto graph template",
    );

    Ok(BoundGraph { graph })
}

fn set_required(
    graph: &mut GraphTemplate,
    target: FieldRef,
    value: serde_json::Value,
) -> Result<(), CoreError> {
    let variant = graph.variant();
    let node = graph.node_mut(target.node).ok_or_else(|| {
        CoreError::Binding(format!("{variant} template has no node '{}'", target.node))
    })?;
    match node.inputs.get_mut(target.field) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(CoreError::Binding(format!(
            "{variant} template node '{}' has no input '{}'",
            target.node, target.field
        ))),
    }
}

/// Write a gated field. Returns whether the node existed.
fn set_gated(graph: &mut GraphTemplate, target: FieldRef, value: serde_json::Value) -> bool {
    match graph.node_mut(target.node) {
        Some(node) => {
            node.inputs.insert(target.field.to_string(), value);
            true
        }
        None => false,
    }
}
