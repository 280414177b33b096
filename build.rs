use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding this crate's Rust sources.
const SOURCE_ROOTS: [&str; 4] = ["validate", "cli", "tests", "benches"];

// Collects matching lines from a single file to build one error message per file.
struct ViolationCollector {
    violations: Vec<String>,
    file_path: PathBuf,
    // Underscore matches inside comments and string literals are not identifiers.
    skip_comments_and_strings: bool,
}

impl ViolationCollector {
    fn new(file_path: &Path, skip_comments_and_strings: bool) -> Self {
        Self {
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
            skip_comments_and_strings,
        }
    }

    fn check_and_get_error_message(&self, what: &str, advice: &str) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {what} in {file_name}:\n",
            self.violations.len()
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {what} are STRICTLY FORBIDDEN in this project.\n"));
        error_msg.push_str(&format!("   {advice}\n"));

        Some(error_msg)
    }
}

fn is_comment_or_string(line_text: &str) -> bool {
    if line_text.trim_start().starts_with("//") {
        return true;
    }
    // Odd-numbered segments between quotes are string contents.
    line_text
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if self.skip_comments_and_strings && is_comment_or_string(line_text) {
            return Ok(true);
        }

        // Same layout as `rg -n`.
        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

struct Rule {
    pattern: &'static str,
    what: &'static str,
    advice: &'static str,
    skip_comments_and_strings: bool,
}

const RULES: [Rule; 2] = [
    Rule {
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        what: "underscore-prefixed variables",
        advice: "Either use the variable (removing the underscore) or remove it completely.",
        skip_comments_and_strings: true,
    },
    Rule {
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        what: "#[allow(dead_code)] attributes",
        advice: "Either use the code (removing the attribute) or remove it completely.",
        skip_comments_and_strings: false,
    },
];

fn source_files() -> impl Iterator<Item = PathBuf> {
    SOURCE_ROOTS.into_iter().flat_map(|root| {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn scan(rule: &Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut searcher = Searcher::new();

    for path in source_files() {
        let mut collector = ViolationCollector::new(&path, rule.skip_comments_and_strings);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message(rule.what, rule.advice)
        {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    for rule in &RULES {
        if let Err(e) = scan(rule) {
            // eprintln! is what surfaces the message in cargo's output.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
