use regex::Regex;

use crate::models::GenerationRequest;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    // operator marker pair, tried alongside the built-in spellings
    pub open_token: String,
    pub close_token: String,
    pub heuristic_enabled: bool,
    pub heuristic_field: String,
    pub heuristic_min_chars: usize,
    pub heuristic_max_chars: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            open_token: "image:{".to_string(),
            close_token: "}".to_string(),
            heuristic_enabled: true,
            heuristic_field: "prompt".to_string(),
            heuristic_min_chars: 40,
            heuristic_max_chars: 1000,
        }
    }
}

// Pure over its input; spans without a closer yield nothing yet
pub struct MarkerScanner {
    plain: Regex,
    reference: Regex,
    field: Regex,
    config: ScannerConfig,
}

impl MarkerScanner {
    pub fn new(config: ScannerConfig) -> Result<Self, regex::Error> {
        // every opener is paired with its own closer
        let mut forms = vec![r"image:\{(.*?)\}".to_string(), r"###image:(.*?)###".to_string()];
        if !config.open_token.is_empty() && !config.close_token.is_empty() {
            forms.insert(
                0,
                format!(
                    "{}(.*?){}",
                    regex::escape(&config.open_token),
                    regex::escape(&config.close_token)
                ),
            );
        }
        let plain = Regex::new(&format!("(?is){}", forms.join("|")))?;
        let reference = Regex::new(r"(?is)imageref:([^\s{}]+)\{(.*?)\}")?;
        let field = Regex::new(&format!(
            r#""{}"\s*:\s*""#,
            regex::escape(&config.heuristic_field)
        ))?;

        Ok(Self {
            plain,
            reference,
            field,
            config,
        })
    }

    pub fn scan(&self, text: &str) -> Vec<GenerationRequest> {
        let mut found: Vec<(usize, GenerationRequest)> = Vec::new();

        for caps in self.plain.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            let body = caps
                .iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str().trim())
                .unwrap_or_default();
            if body.is_empty() {
                continue;
            }
            found.push((whole.start(), GenerationRequest::new(body)));
        }

        for caps in self.reference.captures_iter(text) {
            let (Some(whole), Some(name), Some(body)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let name = name.as_str().trim();
            let body = body.as_str().trim();
            if name.is_empty() || body.is_empty() {
                continue;
            }
            found.push((whole.start(), GenerationRequest::with_reference(body, name)));
        }

        found.sort_by_key(|(start, _)| *start);
        found.into_iter().map(|(_, request)| request).collect()
    }

    // Best-effort prompt from a streaming JSON payload, gated by the
    // configured thresholds. The once-per-message rule lives with the caller.
    pub fn heuristic(&self, payload: &str) -> Option<GenerationRequest> {
        if !self.config.heuristic_enabled {
            return None;
        }
        let fragment = self.extract_field(payload)?;
        let fragment = fragment.trim();
        if fragment.chars().count() < self.config.heuristic_min_chars {
            return None;
        }
        let capped: String = fragment
            .chars()
            .take(self.config.heuristic_max_chars)
            .collect();
        let capped = capped.trim();
        if capped.is_empty() {
            return None;
        }
        Some(GenerationRequest::new(capped))
    }

    // Reads the configured field's string value up to the next unescaped
    // quote, or to the end of the buffer if it is still open.
    pub fn extract_field(&self, payload: &str) -> Option<String> {
        let start = self.field.find(payload)?.end();
        let rest = &payload[start..];

        let mut end = rest.len();
        let mut escaped = false;
        for (idx, ch) in rest.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' => escaped = true,
                '"' => {
                    end = idx;
                    break;
                }
                _ => {}
            }
        }
        Some(unescape_json_fragment(&rest[..end]))
    }
}

fn unescape_json_fragment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        // a trailing lone backslash is an escape cut off mid-stream
        let Some(next) = chars.next() else { break };
        match next {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' | 'f' => {}
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            '/' => out.push('/'),
            'u' => {
                let hex: String = chars.by_ref().take(4).collect();
                if hex.len() < 4 {
                    break;
                }
                if let Some(decoded) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32)
                {
                    out.push(decoded);
                }
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    out
}
