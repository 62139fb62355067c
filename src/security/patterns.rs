//! Static allow-lists and detection patterns used by the auditor.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Base commands a micro-task may run.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "npm", "yarn", "pnpm", "node", "tsc", "ts-node", "git", "ls", "cat", "echo", "mkdir",
    "rmdir", "touch", "cp", "mv", "rm", "grep", "find", "sort", "head", "tail", "wc",
];

/// File extensions a micro-task may touch (without the dot).
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "json", "md", "txt", "css", "scss", "less", "html", "xml",
    "yaml", "yml", "lock", "log",
];

/// A named detection pattern.
pub struct Pattern {
    pub name: &'static str,
    pub regex: Regex,
}

fn compile(table: &[(&'static str, &str)]) -> Vec<Pattern> {
    table
        .iter()
        .map(|&(name, re)| Pattern {
            name,
            regex: Regex::new(re).expect("valid regex"),
        })
        .collect()
}

pub static PATH_TRAVERSAL: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    compile(&[
        ("parent directory", r"\.\./"),
        ("parent directory", r"\.\.\\"),
        ("trailing parent", r"/\.\.$"),
        ("trailing parent", r"\\\.\.$"),
    ])
});

pub static COMMAND_INJECTION: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    compile(&[
        ("command substitution", r"\$\("),
        ("backtick substitution", r"`"),
        ("command chaining", r"&&|\|\||;"),
        ("pipe", r"\|"),
        ("chained rm", r";\s*rm\s"),
        ("chained del", r";\s*del\s"),
        ("chained format", r";\s*format\s"),
        ("redirection", r">"),
    ])
});

pub static CODE_EXECUTION: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    compile(&[
        ("eval", r"\beval\s*\("),
        ("Function constructor", r"\bFunction\s*\("),
        ("string timer", r"\bset(?:Timeout|Interval)\s*\(\s*['`]"),
        ("process spawn", r"\b(?:exec|execSync|spawn|spawnSync)\s*\("),
        ("child_process", r"child_process"),
    ])
});

pub static NETWORK_ACCESS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    compile(&[
        ("fetch", r"\bfetch\s*\("),
        ("axios", r"\baxios\s*[.(]"),
        ("node http", r"\bhttps?\s*\.\s*(?:get|request)\s*\("),
        ("XMLHttpRequest", r"\bXMLHttpRequest\b"),
        ("WebSocket", r"\bnew\s+WebSocket\s*\("),
    ])
});

/// Names of the patterns in `table` that match `text`.
pub fn matching(table: &[Pattern], text: &str) -> Vec<&'static str> {
    let mut names: Vec<&'static str> = table
        .iter()
        .filter(|p| p.regex.is_match(text))
        .map(|p| p.name)
        .collect();
    names.dedup();
    names
}

/// First whitespace-separated token.
pub fn base_command(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or_default()
}

pub fn is_allowed_command(command: &str) -> bool {
    ALLOWED_COMMANDS.contains(&base_command(command))
}

/// `false` for paths without an extension (e.g. `Dockerfile`).
pub fn has_allowed_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
