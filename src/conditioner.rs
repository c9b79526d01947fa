//! Conditioning encoder: lyrics + style tags → embedding prefix.
//!
//! Normalizes the text inputs, formats them into the prompt template the
//! model was trained on, tokenizes with the checkpoint's `tokenizer.json`,
//! and looks the ids up in the shared text embedding table. The resulting
//! `[1, S, hidden]` sequence becomes the conditioning prefix of the
//! language model's context.

use candle_core::{Device, Module, Tensor};
use candle_nn::{embedding, Embedding, VarBuilder};
use tokenizers::Tokenizer;

use crate::config::LmConfig;
use crate::{Error, Result};

/// Normalize lyrics: lowercase, trim each line, collapse runs of blank
/// lines. Structure markers like `[verse]` or `[chorus]` pass through
/// unchanged apart from casing.
pub fn normalize_lyrics(lyrics: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut prev_blank = false;
    for line in lyrics.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !prev_blank && !lines.is_empty() {
                lines.push("");
            }
            prev_blank = true;
        } else {
            lines.push(line);
            prev_blank = false;
        }
    }
    while lines.last() == Some(&"") {
        lines.pop();
    }
    lines.join("\n").to_lowercase()
}

/// Parse a comma-separated tag string: split, trim, lowercase, drop
/// empties, deduplicate preserving first-seen order.
pub fn parse_tags(tags: &str) -> Vec<String> {
    normalize_tags(tags.split(','))
}

/// Trim, lowercase, drop empties, deduplicate preserving first-seen order.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = Vec::new();
    for raw in tags {
        let tag = raw.as_ref().trim().to_lowercase();
        if !tag.is_empty() && !seen.contains(&tag) {
            seen.push(tag);
        }
    }
    seen
}

/// Format normalized inputs into the conditioning prompt.
///
/// ```text
/// # Tags
/// {tag, tag, ...}
///
/// # Lyrics
/// {lyrics}
/// ```
pub fn format_prompt(tags: &[String], lyrics: &str) -> String {
    format!("# Tags\n{}\n\n# Lyrics\n{lyrics}", tags.join(", "))
}

/// Tokenizer + embedding table producing the conditioning prefix.
pub struct ConditioningEncoder {
    tokenizer: Tokenizer,
    text_embeddings: Embedding,
    max_context: usize,
    device: Device,
}

impl ConditioningEncoder {
    /// Weight path: `text_embeddings` under the given VarBuilder.
    ///
    /// Rejects tokenizers whose vocabulary exceeds the configured text
    /// vocabulary, since any out-of-range id would index past the
    /// embedding table.
    pub fn new(
        tokenizer: Tokenizer,
        cfg: &LmConfig,
        device: &Device,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vocab = tokenizer.get_vocab_size(true);
        if vocab > cfg.text_vocab_size {
            return Err(Error::Checkpoint(format!(
                "tokenizer vocabulary ({vocab}) exceeds configured text_vocab_size ({})",
                cfg.text_vocab_size
            )));
        }
        let text_embeddings = embedding(
            cfg.text_vocab_size,
            cfg.hidden_size,
            vb.pp("text_embeddings"),
        )?;
        Ok(Self {
            tokenizer,
            text_embeddings,
            max_context: cfg.max_context,
            device: device.clone(),
        })
    }

    /// Encode lyrics and a comma-separated tag string to the conditioning
    /// prefix `[1, S, hidden]`.
    pub fn encode(&self, lyrics: &str, tags: &str) -> Result<Tensor> {
        self.encode_with_tags(lyrics, &parse_tags(tags))
    }

    /// Encode with the tag list already split.
    ///
    /// Lyrics and tags are both required conditioning signals: lyrics that
    /// normalize to nothing, or a tag list with no non-empty entries, is an
    /// input error.
    pub fn encode_with_tags(&self, lyrics: &str, tags: &[String]) -> Result<Tensor> {
        let tags = normalize_tags(tags);
        let lyrics = normalize_lyrics(lyrics);
        if lyrics.is_empty() {
            return Err(Error::InvalidInput("lyrics must not be empty".into()));
        }
        if tags.is_empty() {
            return Err(Error::InvalidInput(
                "at least one style tag is required".into(),
            ));
        }

        let prompt = format_prompt(&tags, &lyrics);
        let encoding = self.tokenizer.encode(prompt, true)?;
        let ids = encoding.get_ids();
        if ids.is_empty() {
            return Err(Error::InvalidInput(
                "conditioning text tokenized to zero tokens".into(),
            ));
        }
        if ids.len() >= self.max_context {
            return Err(Error::InvalidInput(format!(
                "conditioning text is {} tokens, which fills the {}-token context",
                ids.len(),
                self.max_context
            )));
        }

        let ids = Tensor::from_vec(ids.to_vec(), (1, encoding.len()), &self.device)?;
        Ok(self.text_embeddings.forward(&ids)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;

    #[test]
    fn test_parse_tags_trims_and_dedups() {
        let tags = parse_tags(" Rock ,  synthwave,rock, , 80s,SYNTHWAVE ");
        assert_eq!(tags, vec!["rock", "synthwave", "80s"]);
        assert!(parse_tags("  ,, ,").is_empty());
    }

    #[test]
    fn test_pre_split_tags_are_normalized() {
        let tags = normalize_tags(["  Jazz ", "", "jazz", "Piano"]);
        assert_eq!(tags, vec!["jazz", "piano"]);
    }

    #[test]
    fn test_normalize_lyrics_keeps_markers_and_collapses_blanks() {
        let raw = "  [Verse]\nHello World  \n\n\n\n[Chorus]\nLa la\n\n";
        let norm = normalize_lyrics(raw);
        assert_eq!(norm, "[verse]\nhello world\n\n[chorus]\nla la");
    }

    #[test]
    fn test_format_prompt_layout() {
        let tags = vec!["jazz".to_string(), "piano".to_string()];
        let prompt = format_prompt(&tags, "[intro]\nooh");
        assert!(prompt.starts_with("# Tags\njazz, piano\n"));
        assert!(prompt.contains("# Lyrics\n[intro]\nooh"));
    }

    fn word_level_tokenizer() -> Tokenizer {
        let words = [
            "#", "tags", "lyrics", "jazz", "piano", "hello", "world", "[verse]", "[unk]",
        ];
        let vocab = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), i as u32))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[unk]".to_string())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        tokenizer
    }

    fn tiny_cfg() -> LmConfig {
        LmConfig {
            hidden_size: 8,
            text_vocab_size: 16,
            max_context: 64,
            ..Default::default()
        }
    }

    #[test]
    fn test_encode_produces_prefix() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let enc =
            ConditioningEncoder::new(word_level_tokenizer(), &tiny_cfg(), &Device::Cpu, vb)
                .unwrap();
        let prefix = enc.encode("Hello World", "Jazz, Piano").unwrap();
        let (b, s, h) = prefix.dims3().unwrap();
        assert_eq!(b, 1);
        assert_eq!(h, 8);
        assert!(s > 0);
    }

    #[test]
    fn test_encode_rejects_empty_lyrics_and_empty_tags_independently() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let enc =
            ConditioningEncoder::new(word_level_tokenizer(), &tiny_cfg(), &Device::Cpu, vb)
                .unwrap();
        // Tags present, lyrics blank after normalization.
        assert!(matches!(
            enc.encode("   \n  ", "jazz, piano"),
            Err(Error::InvalidInput(_))
        ));
        // Lyrics present, no usable tag.
        assert!(matches!(
            enc.encode("hello world", " , ,"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            enc.encode("   \n  ", " , ,"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_oversized_tokenizer_vocab_is_a_checkpoint_error() {
        let mut cfg = tiny_cfg();
        cfg.text_vocab_size = 4; // smaller than the tokenizer's 9 words
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(
            ConditioningEncoder::new(word_level_tokenizer(), &cfg, &Device::Cpu, vb),
            Err(Error::Checkpoint(_))
        ));
    }
}
