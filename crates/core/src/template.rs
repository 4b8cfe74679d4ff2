//! Graph templates and the on-disk template store.
//!
//! A template is the engine's API-format graph: a JSON object keyed by
//! node ID where each value carries a `class_type` and an `inputs` map.
//!
//! ```json
//! {
//!   "244": { "class_type": "LoadImage", "inputs": { "image": "in.png" } },
//!   "135": { "class_type": "WanVideoTextEncode", "inputs": { "positive_prompt": "" } }
//! }
//! ```
//!
//! [`TemplateStore`] reads each variant's file once, checks it against the
//! variant's [`BindingDescriptor`](crate::binding::BindingDescriptor) and
//! caches it. Callers always receive their own deep copy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::binding::BindingDescriptor;
use crate::error::CoreError;
use crate::variant::EngineVariant;

// ---------------------------------------------------------------------------
// Graph types
// ---------------------------------------------------------------------------

/// One addressable node of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Engine node class (e.g. "LoadImage", "WanVideoSampler").
    pub class_type: String,
    /// Named input fields. Literal values or `[source_node, slot]` links.
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    /// Anything else the editor exported (`_meta` titles and the like),
    /// kept so the submitted graph matches the file.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An ordered node-ID → node mapping for one engine variant.
///
/// Read-only once loaded into the store; binding always works on a clone.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphTemplate {
    variant: EngineVariant,
    nodes: IndexMap<String, GraphNode>,
}

impl GraphTemplate {
    /// Parse a template from its JSON text.
    ///
    /// `origin` is only used in error messages.
    pub fn from_json(variant: EngineVariant, json: &str, origin: &Path) -> Result<Self, CoreError> {
        let nodes: IndexMap<String, GraphNode> =
            serde_json::from_str(json).map_err(|e| CoreError::TemplateMalformed {
                path: origin.to_path_buf(),
                reason: e.to_string(),
            })?;

        if nodes.is_empty() {
            return Err(CoreError::TemplateMalformed {
                path: origin.to_path_buf(),
                reason: "template must contain at least one node".to_string(),
            });
        }

        Ok(Self { variant, nodes })
    }

    /// Build a template directly from nodes (used by tests and tooling).
    pub fn from_nodes(variant: EngineVariant, nodes: IndexMap<String, GraphNode>) -> Self {
        Self { variant, nodes }
    }

    pub fn variant(&self) -> EngineVariant {
        self.variant
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut GraphNode> {
        self.nodes.get_mut(id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Look up a single input value.
    pub fn input(&self, node_id: &str, field: &str) -> Option<&serde_json::Value> {
        self.nodes.get(node_id)?.inputs.get(field)
    }

    /// Node IDs in document order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Render the graph in the engine's API format (the `prompt` body field).
    pub fn to_prompt(&self) -> serde_json::Value {
        let map = self
            .nodes
            .iter()
            .map(|(id, node)| {
                let value = serde_json::to_value(node).unwrap_or(serde_json::Value::Null);
                (id.clone(), value)
            })
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

// ---------------------------------------------------------------------------
// Template store
// ---------------------------------------------------------------------------

/// Loads and caches one template per engine variant from a directory.
///
/// Safe to share behind an `Arc`; the cache is the only mutable state and
/// it only ever grows.
pub struct TemplateStore {
    dir: PathBuf,
    cache: RwLock<HashMap<EngineVariant, Arc<GraphTemplate>>>,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File the given variant is loaded from.
    pub fn path_for(&self, variant: EngineVariant) -> PathBuf {
        self.dir.join(BindingDescriptor::for_variant(variant).template_file)
    }

    /// Select the template for a request and hand back a private copy.
    ///
    /// Mutating the returned value never affects the cache or any other
    /// caller's copy.
    pub async fn select(
        &self,
        requested: EngineVariant,
        has_end_image: bool,
    ) -> Result<GraphTemplate, CoreError> {
        let variant = EngineVariant::select(requested, has_end_image);
        if variant != requested {
            tracing::debug!(
                requested = %requested,
                selected = %variant,
                "End image supplied, using dual-image template",
            );
        }
        let shared = self.load(variant).await?;
        Ok(GraphTemplate::clone(&shared))
    }

    /// Load (or fetch from cache) the validated template for `variant`.
    pub async fn load(&self, variant: EngineVariant) -> Result<Arc<GraphTemplate>, CoreError> {
        if let Some(cached) = self.cache.read().await.get(&variant) {
            return Ok(Arc::clone(cached));
        }

        let path = self.path_for(variant);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::TemplateNotFound { variant, path });
            }
            Err(e) => return Err(CoreError::Io(e)),
        };

        let template = GraphTemplate::from_json(variant, &text, &path)?;
        BindingDescriptor::for_variant(variant).validate(&template)?;

        tracing::info!(
            variant = %variant,
            path = %path.display(),
            nodes = template.len(),
            "Loaded graph template",
        );

        let mut cache = self.cache.write().await;
        let entry = cache.entry(variant).or_insert_with(|| Arc::new(template));
        Ok(Arc::clone(entry))
    }

    /// Load every known variant up front.
    ///
    /// Missing files are logged and skipped (the variant then fails per
    /// request). A template that does not satisfy its binding descriptor
    /// aborts with [`CoreError::Binding`]. Returns the number loaded.
    pub async fn preload(&self) -> Result<usize, CoreError> {
        let mut loaded = 0;
        for variant in EngineVariant::ALL {
            match self.load(variant).await {
                Ok(_) => loaded += 1,
                Err(CoreError::TemplateNotFound { path, .. }) => {
                    tracing::warn!(
                        variant = %variant,
                        path = %path.display(),
                        "Template file missing, variant unavailable",
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(loaded)
    }
}
