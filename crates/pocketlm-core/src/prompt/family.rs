use serde::{Deserialize, Serialize};

/// Literal prompt layout used when the model's own template is not usable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TemplateStrategy {
    /// `<|im_start|>role ... <|im_end|>`
    ChatMl,
    /// `<|start_header_id|>role<|end_header_id|>`
    Llama3,
    /// `[INST] ... [/INST]`
    Inst,
    /// `<start_of_turn>user` / `<start_of_turn>model`
    Gemma,
    /// `<|user|> ... <|end|>`
    Phi,
    /// `<|start|>role<|channel|>final<|message|>`
    Harmony,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyRule {
    /// Lower-case substrings matched against model name, family hint and path.
    pub keywords: Vec<String>,
    pub strategy: TemplateStrategy,
}

impl FamilyRule {
    pub fn new(keywords: &[&str], strategy: TemplateStrategy) -> Self {
        Self {
            keywords: keywords.iter().map(|k| (*k).to_owned()).collect(),
            strategy,
        }
    }
}

/// Ordered keyword rules; the first rule with any matching keyword wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyTable {
    pub rules: Vec<FamilyRule>,
}

impl Default for FamilyTable {
    fn default() -> Self {
        use TemplateStrategy::*;
        Self {
            rules: vec![
                FamilyRule::new(&["gpt-oss", "harmony"], Harmony),
                FamilyRule::new(&["llama-3", "llama3", "llama_3"], Llama3),
                FamilyRule::new(&["gemma"], Gemma),
                FamilyRule::new(&["phi-3", "phi3", "phi-4", "phi4"], Phi),
                FamilyRule::new(&["mistral", "mixtral", "llama-2", "llama2"], Inst),
                FamilyRule::new(&["qwen", "chatml", "hermes", "smollm", "openchat"], ChatMl),
            ],
        }
    }
}

impl FamilyTable {
    pub fn detect<'a>(&self, haystacks: impl IntoIterator<Item = &'a str>) -> Option<TemplateStrategy> {
        let haystack = haystacks
            .into_iter()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        self.rules
            .iter()
            .find(|rule| rule.keywords.iter().any(|k| haystack.contains(k.as_str())))
            .map(|rule| rule.strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_name_or_path() {
        let table = FamilyTable::default();
        assert_eq!(
            table.detect(["Llama-3.2-1B-Instruct-Q4_K_M"]),
            Some(TemplateStrategy::Llama3)
        );
        assert_eq!(
            table.detect(["model", "/data/models/gemma-2-2b-it.gguf"]),
            Some(TemplateStrategy::Gemma)
        );
        assert_eq!(table.detect(["", "qwen2.5"]), Some(TemplateStrategy::ChatMl));
        assert_eq!(table.detect(["tinystories"]), None);
    }

    #[test]
    fn earlier_rules_win() {
        let table = FamilyTable {
            rules: vec![
                FamilyRule::new(&["special"], TemplateStrategy::Phi),
                FamilyRule::new(&["mistral"], TemplateStrategy::Inst),
            ],
        };
        assert_eq!(
            table.detect(["special-mistral-7b"]),
            Some(TemplateStrategy::Phi)
        );
    }

    #[test]
    fn table_loads_from_toml() {
        let table: FamilyTable = toml::from_str(
            r#"
            [[rules]]
            keywords = ["granite"]
            strategy = "chat_ml"
            "#,
        )
        .expect("parse table");
        assert_eq!(table.detect(["granite-3b"]), Some(TemplateStrategy::ChatMl));
    }
}
