use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source roots covered by the coding policy.
const SOURCE_DIRS: [&str; 4] = ["mixed", "cli", "tests", "benches"];

// Collects every matching line of one file so a single error lists them all.
struct ViolationCollector {
    violations: Vec<String>,
    file_path: PathBuf,
}

// Collects #[allow(dead_code)] attributes.
struct DeadCodeCollector {
    violations: Vec<String>,
    file_path: PathBuf,
}

fn format_violations(header: String, violations: &[String], footer: &[&str]) -> String {
    let mut error_msg = header;
    for violation in violations {
        error_msg.push_str(&format!("   {violation}\n"));
    }
    error_msg.push('\n');
    for line in footer {
        error_msg.push_str(line);
        error_msg.push('\n');
    }
    error_msg
}

impl ViolationCollector {
    fn new(file_path: &Path) -> Self {
        Self {
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let file_name = self.file_path.to_str().unwrap_or("?");
        Some(format_violations(
            format!(
                "\n❌ ERROR: Found {} underscore-prefixed variables in {}:\n",
                self.violations.len(),
                file_name
            ),
            &self.violations,
            &[
                "⚠️ Underscore-prefixed variable names are not allowed in this project.",
                "   Either use the variable (removing the underscore) or remove it completely.",
            ],
        ))
    }
}

impl DeadCodeCollector {
    fn new(file_path: &Path) -> Self {
        Self {
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let file_name = self.file_path.to_str().unwrap_or("?");
        Some(format_violations(
            format!(
                "\n❌ ERROR: Found {} #[allow(dead_code)] attributes in {}:\n",
                self.violations.len(),
                file_name
            ),
            &self.violations,
            &[
                "⚠️ #[allow(dead_code)] attributes are STRICTLY FORBIDDEN in this project.",
                "   Either use the code (removing the attribute) or remove it completely.",
            ],
        ))
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        // Comments and string literals may mention underscore names freely.
        let is_pure_comment = line_text.trim_start().starts_with("//")
            || (line_text.contains("/*") && !line_text.contains("*/"));
        let is_in_string = line_text
            .split('"')
            .enumerate()
            .any(|(i, part)| i % 2 == 1 && part.contains('_'));
        if is_pure_comment || is_in_string {
            return Ok(true);
        }

        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

impl Sink for DeadCodeCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

fn rust_sources() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn scan_for_underscore_prefixes(sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(r"\b(_[a-zA-Z0-9_]+)\b")?;
    let mut searcher = Searcher::new();
    for path in sources {
        let mut collector = ViolationCollector::new(path);
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn scan_for_allow_dead_code(sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]")?;
    let mut searcher = Searcher::new();
    for path in sources {
        let mut collector = DeadCodeCollector::new(path);
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let sources = rust_sources();
    if let Err(e) = scan_for_underscore_prefixes(&sources) {
        eprintln!("{e}");
        std::process::exit(1);
    }
    if let Err(e) = scan_for_allow_dead_code(&sources) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
