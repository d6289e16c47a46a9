//! Which remote paths are tracked, and which are tracked without content.
//!
//! A path is *tracked* when it matches an include glob (a tracked file type)
//! and none of the ignore globs (build output, dependency directories,
//! binary assets). A tracked path is *metadata-only* when it matches a
//! metadata-only glob (minified or generated files) or exceeds the size cap.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::SyncConfig;

const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/node_modules/**",
    "**/target/**",
    "**/dist/**",
    "**/build/**",
    "**/out/**",
    "**/vendor/**",
    "**/__pycache__/**",
    "**/.venv/**",
    "**/.next/**",
    "**/coverage/**",
];

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tiff", "pdf", "zip", "gz", "tgz", "bz2",
    "xz", "7z", "rar", "jar", "war", "class", "exe", "dll", "so", "dylib", "a", "o", "obj", "bin",
    "wasm", "woff", "woff2", "ttf", "otf", "eot", "mp3", "mp4", "mov", "avi", "wav", "flac",
    "sqlite", "db", "pyc",
];

/// Compiled path policy for one worker.
pub struct FilePolicy {
    include: GlobSet,
    exclude: GlobSet,
    metadata_only: GlobSet,
    max_file_size: u64,
}

impl FilePolicy {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(BINARY_EXTENSIONS.iter().map(|ext| format!("**/*.{}", ext)));
        excludes.extend(config.exclude_globs.clone());

        Ok(Self {
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            metadata_only: build_globset(&config.metadata_only_globs)?,
            max_file_size: config.max_file_size,
        })
    }

    /// True when the path should appear in the mirrored file set.
    pub fn is_tracked(&self, path: &str) -> bool {
        !self.exclude.is_match(path) && self.include.is_match(path)
    }

    /// True when the path is tracked but its content is never fetched.
    pub fn is_metadata_only_path(&self, path: &str) -> bool {
        self.metadata_only.is_match(path)
    }

    pub fn is_oversized(&self, size: u64) -> bool {
        size > self.max_file_size
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Language name guessed from the file extension.
pub fn detect_language(path: &str) -> Option<&'static str> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    match file_name {
        "Dockerfile" => return Some("dockerfile"),
        "Makefile" => return Some("makefile"),
        _ => {}
    }

    let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    let lang = match ext.as_str() {
        "rs" => "rust",
        "go" => "go",
        "py" => "python",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "java" => "java",
        "kt" => "kotlin",
        "scala" => "scala",
        "rb" => "ruby",
        "php" => "php",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" => "cpp",
        "cs" => "csharp",
        "swift" => "swift",
        "m" => "objective-c",
        "sh" => "shell",
        "sql" => "sql",
        "md" => "markdown",
        "rst" => "restructuredtext",
        "txt" => "text",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        "html" => "html",
        "css" | "scss" => "css",
        "vue" => "vue",
        "svelte" => "svelte",
        "lua" => "lua",
        "ex" | "exs" => "elixir",
        "hs" => "haskell",
        "ml" => "ocaml",
        "dart" => "dart",
        "proto" => "protobuf",
        "graphql" => "graphql",
        _ => return None,
    };
    Some(lang)
}
