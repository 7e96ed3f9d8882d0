use serde::{Deserialize, Serialize};

/// Capability flags advertised for a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCapabilities {
    pub vision: bool,
    pub chat: bool,
    pub completion: bool,
    pub embedding: bool,
    pub tool_calling: bool,
}

impl ModelCapabilities {
    const fn chat() -> Self {
        Self {
            vision: false,
            chat: true,
            completion: true,
            embedding: false,
            tool_calling: false,
        }
    }

    const fn with_tools(mut self) -> Self {
        self.tool_calling = true;
        self
    }

    const fn with_vision(mut self) -> Self {
        self.vision = true;
        self
    }

    const fn embedding() -> Self {
        Self {
            vision: false,
            chat: false,
            completion: false,
            embedding: true,
            tool_calling: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub name: String,
    pub id: String,
    pub family: String,
    pub capabilities: ModelCapabilities,
}

impl ModelMetadata {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        family: impl Into<String>,
        capabilities: ModelCapabilities,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            family: family.into(),
            capabilities,
        }
    }
}

// (name, id, family, capabilities). Order matters for the family pass: more
// specific families come before the ones they contain.
#[rustfmt::skip]
const BUILTIN_MODELS: &[(&str, &str, &str, ModelCapabilities)] = &[
    ("llama3.2-vision", "llama3.2-vision:11b", "llama3.2-vision", ModelCapabilities::chat().with_vision()),
    ("bakllava", "bakllava:7b", "bakllava", ModelCapabilities::chat().with_vision()),
    ("llava", "llava:7b", "llava", ModelCapabilities::chat().with_vision()),
    ("llava-llama3", "llava-llama3:8b", "llava", ModelCapabilities::chat().with_vision()),
    ("moondream", "moondream:1.8b", "moondream", ModelCapabilities::chat().with_vision()),
    ("minicpm-v", "minicpm-v:8b", "minicpm-v", ModelCapabilities::chat().with_vision()),
    ("qwen2.5vl", "qwen2.5vl:7b", "qwen2.5vl", ModelCapabilities::chat().with_vision().with_tools()),
    ("gemma3", "gemma3:4b", "gemma3", ModelCapabilities::chat().with_vision()),
    ("llama3.1", "llama3.1:8b", "llama3.1", ModelCapabilities::chat().with_tools()),
    ("llama3.2", "llama3.2:3b", "llama3.2", ModelCapabilities::chat().with_tools()),
    ("llama3.3", "llama3.3:70b", "llama3.3", ModelCapabilities::chat().with_tools()),
    ("qwen2.5-coder", "qwen2.5-coder:7b", "qwen2.5-coder", ModelCapabilities::chat().with_tools()),
    ("qwen2.5", "qwen2.5:7b", "qwen2.5", ModelCapabilities::chat().with_tools()),
    ("qwen3", "qwen3:8b", "qwen3", ModelCapabilities::chat().with_tools()),
    ("mistral-nemo", "mistral-nemo:12b", "mistral-nemo", ModelCapabilities::chat().with_tools()),
    ("mistral", "mistral:7b", "mistral", ModelCapabilities::chat().with_tools()),
    ("phi4", "phi4:14b", "phi4", ModelCapabilities::chat()),
    ("phi3", "phi3:3.8b", "phi3", ModelCapabilities::chat()),
    ("deepseek-r1", "deepseek-r1:7b", "deepseek-r1", ModelCapabilities::chat()),
    ("codellama", "codellama:7b", "codellama", ModelCapabilities::chat()),
    ("nomic-embed-text", "nomic-embed-text:latest", "nomic-bert", ModelCapabilities::embedding()),
    ("mxbai-embed-large", "mxbai-embed-large:latest", "mxbai", ModelCapabilities::embedding()),
];

/// Read-only capability table. Lookups are deterministic and side-effect free.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<ModelMetadata>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_models() -> Self {
        let models = BUILTIN_MODELS
            .iter()
            .map(|(name, id, family, caps)| {
                ModelMetadata::new(*name, *id, *family, *caps)
            })
            .collect();
        Self { models }
    }

    /// Entries registered later lose ties against earlier ones at every
    /// lookup stage.
    pub fn register(&mut self, metadata: ModelMetadata) {
        self.models.push(metadata);
    }

    /// Exact name, then exact id, then base name (text before `:`), then
    /// family substring.
    pub fn lookup(&self, model: &str) -> Option<&ModelMetadata> {
        let wanted = model.trim().to_ascii_lowercase();
        if wanted.is_empty() {
            return None;
        }

        if let Some(hit) = self.models.iter().find(|m| m.name.eq_ignore_ascii_case(&wanted)) {
            return Some(hit);
        }
        if let Some(hit) = self.models.iter().find(|m| m.id.eq_ignore_ascii_case(&wanted)) {
            return Some(hit);
        }

        let base = base_name(&wanted);
        if let Some(hit) = self
            .models
            .iter()
            .find(|m| base_name(&m.name).eq_ignore_ascii_case(base))
        {
            return Some(hit);
        }

        self.models.iter().find(|m| family_matches(m, &wanted))
    }

    pub fn capabilities(&self, model: &str) -> ModelCapabilities {
        self.lookup(model)
            .map(|metadata| metadata.capabilities)
            .unwrap_or_default()
    }

    pub fn supports_vision(&self, model: &str) -> bool {
        self.capabilities(model).vision
    }

    pub fn supports_tool_calling(&self, model: &str) -> bool {
        self.capabilities(model).tool_calling
    }

    pub fn models(&self) -> &[ModelMetadata] {
        &self.models
    }
}

fn family_matches(metadata: &ModelMetadata, wanted: &str) -> bool {
    !metadata.family.is_empty() && wanted.contains(&metadata.family.to_ascii_lowercase())
}

fn base_name(model: &str) -> &str {
    model.split(':').next().unwrap_or(model)
}
