//! Model groups and model-name helpers

/// A family of presets served by the same backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelGroup {
    Custom,
    ChatgptWeb,
    ClaudeWeb,
    MoonshotWeb,
    BingWeb,
    GeminiWeb,
    ChatgptApi,
    ClaudeApi,
    MoonshotApi,
    ChatGlmApi,
    OllamaApi,
    AzureOpenAiApi,
    GptCompletionApi,
    GithubThirdPartyApi,
}

/// `(preset key, upstream model value)` pairs
type Presets = &'static [(&'static str, &'static str)];

const CUSTOM: Presets = &[("customModel", "")];
const CHATGPT_WEB: Presets = &[
    ("chatgptFree35", "auto"),
    ("chatgptFree4o", "gpt-4o"),
    ("chatgptFree4oMini", "gpt-4o-mini"),
    ("chatgptPlus4", "gpt-4"),
    ("chatgptFree35Mobile", "text-davinci-002-render-sha-mobile"),
    ("chatgptPlus4Browsing", "gpt-4"),
    ("chatgptPlus4Mobile", "gpt-4-mobile"),
];
const CLAUDE_WEB: Presets = &[("claude2WebFree", "")];
const MOONSHOT_WEB: Presets = &[
    ("moonshotWebFree", "k1.5"),
    ("moonshotWebFreeK15", "k1.5"),
    ("moonshotWebFreeK15Think", "k1.5-thinking"),
];
const BING_WEB: Presets = &[("bingFree4", ""), ("bingFreeSydney", "")];
const GEMINI_WEB: Presets = &[("bardWebFree", "")];
const CHATGPT_API: Presets = &[
    ("chatgptApi35", "gpt-3.5-turbo"),
    ("chatgptApi35_16k", "gpt-3.5-turbo-16k"),
    ("chatgptApi4o_128k", "gpt-4o"),
    ("chatgptApi4oMini", "gpt-4o-mini"),
    ("chatgptApi4_8k", "gpt-4"),
    ("chatgptApi4_32k", "gpt-4-32k"),
    ("chatgptApi4_128k", "gpt-4-turbo"),
];
const CLAUDE_API: Presets = &[
    ("claude12Api", "claude-instant-1.2"),
    ("claude2Api", "claude-2.0"),
    ("claude21Api", "claude-2.1"),
    ("claude3HaikuApi", "claude-3-haiku-20240307"),
    ("claude3SonnetApi", "claude-3-sonnet-20240229"),
    ("claude3OpusApi", "claude-3-opus-20240229"),
    ("claude35SonnetApi", "claude-3-5-sonnet-20240620"),
];
const MOONSHOT_API: Presets = &[
    ("moonshot_v1_8k", "moonshot-v1-8k"),
    ("moonshot_v1_32k", "moonshot-v1-32k"),
    ("moonshot_v1_128k", "moonshot-v1-128k"),
];
const CHATGLM_API: Presets = &[
    ("chatglmTurbo", "GLM-4-Air"),
    ("chatglm4", "GLM-4-0520"),
    ("chatglmEmohaa", "Emohaa"),
    ("chatglmCharGLM3", "CharGLM-3"),
];
const OLLAMA_API: Presets = &[("ollamaModel", "")];
const AZURE_OPENAI_API: Presets = &[("azureOpenAi", "")];
const GPT_COMPLETION_API: Presets = &[
    ("gptApiInstruct", "gpt-3.5-turbo-instruct"),
    ("gptApiDavinci", "text-davinci-003"),
];
const GITHUB_THIRD_PARTY_API: Presets = &[("waylaidwandererApi", "")];

impl ModelGroup {
    /// Every group, in dispatch priority order
    pub const DISPATCH_ORDER: [ModelGroup; 14] = [
        ModelGroup::Custom,
        ModelGroup::ChatgptWeb,
        ModelGroup::ClaudeWeb,
        ModelGroup::MoonshotWeb,
        ModelGroup::BingWeb,
        ModelGroup::GeminiWeb,
        ModelGroup::ChatgptApi,
        ModelGroup::ClaudeApi,
        ModelGroup::MoonshotApi,
        ModelGroup::ChatGlmApi,
        ModelGroup::OllamaApi,
        ModelGroup::AzureOpenAiApi,
        ModelGroup::GptCompletionApi,
        ModelGroup::GithubThirdPartyApi,
    ];

    /// Group key as used in `ApiMode.groupName`
    pub fn key(self) -> &'static str {
        match self {
            ModelGroup::Custom => "customApiModelKeys",
            ModelGroup::ChatgptWeb => "chatgptWebModelKeys",
            ModelGroup::ClaudeWeb => "claudeWebModelKeys",
            ModelGroup::MoonshotWeb => "moonshotWebModelKeys",
            ModelGroup::BingWeb => "bingWebModelKeys",
            ModelGroup::GeminiWeb => "bardWebModelKeys",
            ModelGroup::ChatgptApi => "chatgptApiModelKeys",
            ModelGroup::ClaudeApi => "claudeApiModelKeys",
            ModelGroup::MoonshotApi => "moonshotApiModelKeys",
            ModelGroup::ChatGlmApi => "chatglmApiModelKeys",
            ModelGroup::OllamaApi => "ollamaApiModelKeys",
            ModelGroup::AzureOpenAiApi => "azureOpenAiApiModelKeys",
            ModelGroup::GptCompletionApi => "gptApiModelKeys",
            ModelGroup::GithubThirdPartyApi => "githubThirdPartyApiModelKeys",
        }
    }

    pub fn from_key(key: &str) -> Option<ModelGroup> {
        Self::DISPATCH_ORDER.into_iter().find(|g| g.key() == key)
    }

    fn presets(self) -> Presets {
        match self {
            ModelGroup::Custom => CUSTOM,
            ModelGroup::ChatgptWeb => CHATGPT_WEB,
            ModelGroup::ClaudeWeb => CLAUDE_WEB,
            ModelGroup::MoonshotWeb => MOONSHOT_WEB,
            ModelGroup::BingWeb => BING_WEB,
            ModelGroup::GeminiWeb => GEMINI_WEB,
            ModelGroup::ChatgptApi => CHATGPT_API,
            ModelGroup::ClaudeApi => CLAUDE_API,
            ModelGroup::MoonshotApi => MOONSHOT_API,
            ModelGroup::ChatGlmApi => CHATGLM_API,
            ModelGroup::OllamaApi => OLLAMA_API,
            ModelGroup::AzureOpenAiApi => AZURE_OPENAI_API,
            ModelGroup::GptCompletionApi => GPT_COMPLETION_API,
            ModelGroup::GithubThirdPartyApi => GITHUB_THIRD_PARTY_API,
        }
    }

    /// Groups whose api modes are always named after the group
    pub fn is_always_custom(self) -> bool {
        matches!(
            self,
            ModelGroup::Custom | ModelGroup::OllamaApi | ModelGroup::AzureOpenAiApi
        )
    }

    pub fn contains(self, preset: &str) -> bool {
        self.presets().iter().any(|(key, _)| *key == preset)
    }
}

fn all_presets() -> impl Iterator<Item = &'static (&'static str, &'static str)> {
    ModelGroup::DISPATCH_ORDER
        .into_iter()
        .flat_map(|g| g.presets().iter())
}

/// Whether `name` is a known preset key
pub fn is_preset(name: &str) -> bool {
    all_presets().any(|(key, _)| *key == name)
}

/// Strip a customization suffix from a model name.
///
/// `chatgptApi4_8k-mine` → `chatgptApi4_8k`. Names that are already presets,
/// and names with no known preset prefix, come back unchanged.
pub fn preset_part(model_name: &str) -> &str {
    if is_preset(model_name) {
        return model_name;
    }
    all_presets()
        .map(|(key, _)| *key)
        .filter(|key| {
            model_name.len() > key.len()
                && model_name.starts_with(key)
                && model_name.as_bytes()[key.len()] == b'-'
        })
        .max_by_key(|key| key.len())
        .unwrap_or(model_name)
}

/// Customization suffix of a model name, if any
pub fn custom_part(model_name: &str) -> Option<&str> {
    let preset = preset_part(model_name);
    model_name
        .strip_prefix(preset)
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|rest| !rest.is_empty())
}

/// Upstream model identifier for a model name.
///
/// A customization suffix wins over the preset's own value, so
/// `ollamaModel-llama3` asks the server for `llama3`.
pub fn upstream_model(model_name: &str) -> Option<&str> {
    if let Some(custom) = custom_part(model_name) {
        return Some(custom);
    }
    all_presets()
        .find(|(key, _)| *key == model_name)
        .map(|(_, value)| *value)
        .filter(|value| !value.is_empty())
}
