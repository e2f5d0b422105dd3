//! HTML→Markdown conversion and the default (non-LLM) content filter.
//!
//! `html_to_raw_markdown` / `sanitize_markdown` are a direct port of the
//! teacher's `crawl::fetch_and_convert_page` conversion pipeline: the same
//! `html-to-markdown-rs` options, the same code-block visitor, and the same
//! boilerplate-stripping pass. `prune_to_fit` is the non-LLM stand-in for
//! the original's `PruningContentFilter`: a density-based heuristic that
//! discards short, link-heavy, or otherwise low-signal blocks.

use std::sync::OnceLock;

use regex::Regex;

use html_to_markdown_rs::{
    convert_with_visitor,
    options::{CodeBlockStyle, ConversionOptions, HeadingStyle},
    visitor::{HtmlVisitor, NodeContext, VisitResult},
};

pub fn html_to_raw_markdown(html: &str) -> String {
    let options = ConversionOptions {
        heading_style: HeadingStyle::Atx,
        code_block_style: CodeBlockStyle::Backticks,
        extract_metadata: false,
        wrap: false,
        strip_newlines: true,
        whitespace_mode: html_to_markdown_rs::WhitespaceMode::Normalized,
        strip_tags: vec![
            "img".to_string(),
            "svg".to_string(),
            "picture".to_string(),
            "source".to_string(),
        ],
        preprocessing: html_to_markdown_rs::options::PreprocessingOptions {
            enabled: true,
            preset: html_to_markdown_rs::options::PreprocessingPreset::default(),
            remove_navigation: true,
            remove_forms: true,
        },
        ..Default::default()
    };

    match convert_with_code_visitor(html, options) {
        Ok(md) => sanitize_markdown(&md),
        Err(_) => String::new(),
    }
}

/// Minimum fraction of non-whitespace characters a paragraph must retain
/// after stripping link syntax to be judged "content" rather than a link
/// list or navigation remnant (mirrors `PruningContentFilter`'s threshold).
const PRUNE_DENSITY_THRESHOLD: f64 = 0.30;
const PRUNE_MIN_WORDS: usize = 5;

/// Heuristic replacement for the original's LLM/pruning content filter when
/// no LLM is in play. Keeps paragraphs with enough prose density and word
/// count, drops the rest. Returns `None` if nothing survives the cut.
pub fn prune_to_fit(raw_markdown: &str) -> Option<String> {
    let mut kept = Vec::new();

    for block in raw_markdown.split("\n\n") {
        let trimmed = block.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('#') {
            kept.push(trimmed.to_string());
            continue;
        }

        let word_count = trimmed.split_whitespace().count();
        if word_count < PRUNE_MIN_WORDS {
            continue;
        }

        let link_stripped = markdown_link_regex().replace_all(trimmed, "$text");
        let density = if trimmed.is_empty() {
            0.0
        } else {
            link_stripped.chars().filter(|c| !c.is_whitespace()).count() as f64
                / trimmed.chars().filter(|c| !c.is_whitespace()).count().max(1) as f64
        };

        if density >= PRUNE_DENSITY_THRESHOLD {
            kept.push(trimmed.to_string());
        }
    }

    if kept.is_empty() {
        None
    } else {
        Some(kept.join("\n\n"))
    }
}

fn markdown_link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(?P<text>[^\]]*)\]\([^)]*\)").unwrap())
}

/// `\[...\](...)` link targets found in raw markdown (spec.md §4.D link
/// extraction always runs over raw markdown, never the filtered content).
pub fn link_targets(raw_markdown: &str) -> Vec<String> {
    link_target_regex()
        .captures_iter(raw_markdown)
        .map(|c| c[1].to_string())
        .collect()
}

fn link_target_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\]]*\]\(([^)]*)\)").unwrap())
}

/// First level-1 heading in raw markdown, empty string if absent.
pub fn first_h1_title(raw_markdown: &str) -> String {
    title_regex()
        .captures(raw_markdown)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default()
}

fn title_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^# (.+)$").unwrap())
}

fn image_md_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[[^\]]*\]\([^)]+\)").unwrap())
}

fn img_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<img[^>]*>").unwrap())
}

fn footer_heading_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^#{1,6}\s*footer\b").unwrap())
}

fn link_only_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\[[^\]]+\]\([^)]+\)\s*)+$").unwrap())
}

fn junk_only_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\[\]\(\)\{\}\|\\/\-_.*•·\s]+$").unwrap())
}

fn copyright_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(©|\(c\))\s+.*\b(19|20)\d{2}\b.*$").unwrap())
}

pub fn sanitize_markdown_for_test(input: &str) -> String {
    sanitize_markdown(input)
}

fn sanitize_markdown(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_code = false;
    let mut in_svg = false;
    let mut prev_blank = false;
    let mut skipping_frontmatter = false;
    let mut frontmatter_checked = false;
    let mut in_footer = false;
    let mut saw_content = false;
    let mut saw_heading = false;
    let mut in_trailing_links = false;

    for raw_line in input.lines() {
        let line = raw_line.trim_end();
        let trimmed = line.trim_start();

        if !frontmatter_checked {
            frontmatter_checked = true;
            if trimmed == "---" {
                skipping_frontmatter = true;
                continue;
            }
        }

        if skipping_frontmatter {
            if trimmed == "---" {
                skipping_frontmatter = false;
            }
            continue;
        }

        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_code = !in_code;
            out.push_str(line);
            out.push('\n');
            prev_blank = false;
            continue;
        }

        if !in_code {
            if trimmed.contains("<svg") {
                in_svg = true;
            }
            if in_svg {
                if trimmed.contains("</svg>") {
                    in_svg = false;
                }
                continue;
            }
        }

        if !in_code && footer_heading_regex().is_match(trimmed) {
            in_footer = true;
            continue;
        }

        if in_footer {
            if trimmed.starts_with('#') {
                in_footer = false;
            } else {
                continue;
            }
        }

        if !in_code && trimmed.starts_with('#') {
            saw_heading = true;
        }

        if !in_code && !saw_content {
            if trimmed == "---" || trimmed == "***" || trimmed == "___" {
                continue;
            }
            if trimmed.is_empty() {
                continue;
            }
        }

        let mut cleaned = line.to_string();
        if !in_code {
            cleaned = image_md_regex().replace_all(&cleaned, "").to_string();
            cleaned = img_tag_regex().replace_all(&cleaned, "").to_string();
        }

        if !in_code {
            let trimmed = cleaned.trim();
            if !saw_heading && link_only_line_regex().is_match(trimmed) {
                continue;
            }
            if in_trailing_links {
                if trimmed.starts_with('#') {
                    in_trailing_links = false;
                } else if link_only_line_regex().is_match(trimmed) || trimmed.is_empty() {
                    continue;
                } else {
                    in_trailing_links = false;
                }
            }
            if !in_trailing_links && link_only_line_regex().is_match(trimmed) {
                in_trailing_links = true;
                continue;
            }
            if copyright_line_regex().is_match(trimmed) {
                continue;
            }
            if junk_only_line_regex().is_match(trimmed) {
                continue;
            }
            if trimmed == "---" || trimmed == "***" || trimmed == "___" {
                continue;
            }
        }

        if cleaned.trim().is_empty() {
            if !prev_blank {
                out.push('\n');
                prev_blank = true;
            }
            continue;
        }

        prev_blank = false;
        saw_content = true;
        out.push_str(cleaned.trim_end());
        out.push('\n');
    }

    out
}

#[derive(Debug)]
struct CodeBlockVisitor {
    code_block_style: CodeBlockStyle,
    default_language: String,
}

impl HtmlVisitor for CodeBlockVisitor {
    fn visit_code_block(&mut self, _ctx: &NodeContext, lang: Option<&str>, code: &str) -> VisitResult {
        let raw = lang.unwrap_or("").trim().to_ascii_lowercase();
        let lang = match raw.as_str() {
            "ts" => "typescript".to_string(),
            "js" => "javascript".to_string(),
            "py" => "python".to_string(),
            "sh" | "shell" => "bash".to_string(),
            _ => raw,
        };

        let lang = if !lang.is_empty() {
            lang
        } else if !self.default_language.is_empty() {
            self.default_language.clone()
        } else {
            String::new()
        };

        let fence = if self.code_block_style == CodeBlockStyle::Tildes {
            "~~~"
        } else {
            "```"
        };
        let mut out = String::new();
        out.push_str(fence);
        if !lang.is_empty() {
            out.push_str(&lang);
        }
        out.push('\n');
        out.push_str(code.trim_matches('\n'));
        out.push('\n');
        out.push_str(fence);
        out.push('\n');
        VisitResult::Custom(out)
    }
}

fn convert_with_code_visitor(html: &str, options: ConversionOptions) -> anyhow::Result<String> {
    let visitor = CodeBlockVisitor {
        code_block_style: options.code_block_style,
        default_language: options.code_language.clone(),
    };
    let handle = std::rc::Rc::new(std::cell::RefCell::new(visitor));
    Ok(convert_with_visitor(html, Some(options), Some(handle))?)
}

/// Test-only entry point exercising the code-block visitor directly with an
/// arbitrary option set, independent of [`html_to_raw_markdown`]'s fixed
/// production options.
pub fn convert_with_code_visitor_for_test(html: &str, options: Option<ConversionOptions>) -> anyhow::Result<String> {
    convert_with_code_visitor(html, options.unwrap_or_default())
}
