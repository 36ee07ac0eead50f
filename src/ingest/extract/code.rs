//! Source code extraction
//!
//! Splits source files at function/class boundaries per language and carries
//! the file's import section into every block so definitions keep their
//! context when embedded in isolation.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Result;
use crate::types::{Metadata, Scalar, TextBlock};

use super::Extractor;

const LANGUAGE_MAP: &[(&str, &str)] = &[
    (".py", "python"),
    (".js", "javascript"),
    (".jsx", "javascript"),
    (".ts", "typescript"),
    (".tsx", "typescript"),
    (".java", "java"),
    (".go", "go"),
    (".rs", "rust"),
    (".rb", "ruby"),
    (".php", "php"),
    (".c", "c"),
    (".h", "c"),
    (".cpp", "cpp"),
    (".hpp", "cpp"),
    (".cs", "csharp"),
    (".swift", "swift"),
    (".kt", "kotlin"),
    (".scala", "scala"),
    (".sql", "sql"),
    (".sh", "shell"),
    (".bash", "shell"),
    (".yaml", "yaml"),
    (".yml", "yaml"),
    (".toml", "toml"),
    (".xml", "xml"),
    (".html", "html"),
    (".css", "css"),
    (".scss", "scss"),
];

static PYTHON_DEF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:class |def |async def )").expect("valid regex"));
static JS_DEF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:function |class |const \w+ = (?:async )?\(|export (?:default )?(?:function|class) )")
        .expect("valid regex")
});
static TS_DEF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:function |class |const \w+ = (?:async )?\(|export (?:default )?(?:function|class|interface|type) |interface |type )")
        .expect("valid regex")
});
static GO_DEF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:func |type )").expect("valid regex"));
static RUST_DEF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:pub )?(?:fn |struct |enum |trait |impl |mod )").expect("valid regex")
});

fn definition_pattern(language: &str) -> Option<&'static Regex> {
    match language {
        "python" => Some(&PYTHON_DEF_RE),
        "javascript" => Some(&JS_DEF_RE),
        "typescript" => Some(&TS_DEF_RE),
        "go" => Some(&GO_DEF_RE),
        "rust" => Some(&RUST_DEF_RE),
        _ => None,
    }
}

fn is_import_line(line: &str, language: &str) -> bool {
    let stripped = line.trim_start();
    match language {
        "python" => stripped.starts_with("import ") || stripped.starts_with("from "),
        "javascript" | "typescript" => {
            stripped.starts_with("import ")
                || (stripped.starts_with("const ") && stripped.contains("require("))
        }
        "go" => stripped.starts_with("import"),
        "java" => stripped.starts_with("import ") || stripped.starts_with("package "),
        "rust" => stripped.starts_with("use "),
        _ => false,
    }
}

fn definition_name(line: &str) -> String {
    line.trim()
        .split('(')
        .next()
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("")
        .trim()
        .to_string()
}

pub struct CodeExtractor;

impl CodeExtractor {
    fn block(
        content: String,
        language: &str,
        name: &str,
        filename: &str,
    ) -> TextBlock {
        let mut metadata = Metadata::new();
        metadata.insert("file_type".into(), Scalar::Str("code".into()));
        metadata.insert("language".into(), Scalar::Str(language.to_string()));
        metadata.insert("file_path".into(), Scalar::Str(filename.to_string()));
        if !name.is_empty() {
            metadata.insert("definition_name".into(), Scalar::Str(name.to_string()));
        }
        TextBlock::new(content, metadata)
    }
}

impl Extractor for CodeExtractor {
    fn extensions(&self) -> Vec<&'static str> {
        LANGUAGE_MAP.iter().map(|(ext, _)| *ext).collect()
    }

    fn extract(&self, path: &Path) -> Result<Vec<TextBlock>> {
        let raw = std::fs::read(path)?;
        let content = String::from_utf8_lossy(&raw).into_owned();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        let language = LANGUAGE_MAP
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, lang)| *lang)
            .unwrap_or("unknown");
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let imports: Vec<&str> = content
            .lines()
            .filter(|line| is_import_line(line, language))
            .collect();
        let imports_block = imports.join("\n");

        let Some(pattern) = definition_pattern(language) else {
            return Ok(vec![Self::block(content, language, "", &filename)]);
        };

        let mut blocks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_name = String::new();

        let mut flush = |lines: &mut Vec<&str>, name: &str, blocks: &mut Vec<TextBlock>| {
            let body = lines.join("\n");
            let body = body.trim();
            if body.len() > 20 {
                let full = if imports_block.is_empty() {
                    body.to_string()
                } else {
                    format!("{}\n\n{}", imports_block, body)
                };
                blocks.push(Self::block(full, language, name, &filename));
            }
            lines.clear();
        };

        for line in content.lines() {
            if pattern.is_match(line) {
                flush(&mut current, &current_name, &mut blocks);
                current_name = definition_name(line);
                current.push(line);
            } else {
                current.push(line);
            }
        }
        flush(&mut current, &current_name, &mut blocks);

        if blocks.is_empty() {
            blocks.push(Self::block(content, language, "", &filename));
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetadataExt;

    #[test]
    fn test_python_split_by_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.py");
        std::fs::write(
            &path,
            "import math\n\ndef squat_volume(sets, reps):\n    return sets * reps\n\n\nclass Program:\n    def __init__(self):\n        self.weeks = 12\n",
        )
        .unwrap();

        let blocks = CodeExtractor.extract(&path).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            blocks[0].metadata.str_field("definition_name"),
            Some("def squat_volume")
        );
        // Imports carried into every block
        assert!(blocks[1].content.starts_with("import math"));
        assert_eq!(blocks[1].metadata.str_field("language"), Some("python"));
    }

    #[test]
    fn test_unknown_language_single_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("styles.css");
        std::fs::write(&path, "body { margin: 0; padding: 0; color: #333; }\n").unwrap();
        let blocks = CodeExtractor.extract(&path).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].metadata.str_field("language"), Some("css"));
    }
}
