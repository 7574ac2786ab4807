//! Build-time tenant-scope scanner.
//!
//! Walks Rust sources with `syn`, extracts every string constant that looks
//! like a graph query (including literals inside `format!`-style macros,
//! whose placeholders become an `$INTERPOLATED` marker), and reports the
//! constants that lack tenant scoping. The workspace test in
//! `tests/tenant_scope_scan.rs` runs this over every member crate, so an
//! unscoped query constant fails the build's test gate rather than a
//! production request.

use once_cell::sync::Lazy;
use proc_macro2::TokenTree;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use syn::visit::Visit;

use crate::session::{is_schema_ddl, query_references_tenant_id, SCHEMA_DDL_ALLOWLIST};

/// Marker substituted for macro interpolations. A statement assembled from
/// parts is judged by its assembled form at runtime, not by the scanner.
pub const INTERPOLATED_MARKER: &str = "$INTERPOLATED";

const MIN_QUERY_LEN: usize = 15;

static CYPHER_STATEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:^|\s)(?:MATCH\s*[\(\[]|MERGE\s*[\(\[]|UNWIND\s+\$|CREATE\s+(?:RANGE|VECTOR|FULLTEXT|TEXT|POINT|LOOKUP|CONSTRAINT)|CALL\s+(?:db\.|dbms\.|apoc\.|gds\.))",
    )
    .unwrap()
});

/// Labels used only by internal plumbing (outbox, schema pointer); their
/// queries are infrastructure, not tenant data.
static INTERNAL_NODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(OutboxEvent|_SchemaPointer)\b").unwrap());

static ADMIN_MAINTENANCE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?is)tombstoned_at\s+IS\s+NOT\s+NULL.*DELETE\s+r").unwrap(),
        Regex::new(r"(?is)tombstoned_at\s+IS\s+NOT\s+NULL.*RETURN\s+DISTINCT").unwrap(),
    ]
});

static FORMAT_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^{}]*\}").unwrap());

/// True when a string constant is plausibly a graph query.
pub fn looks_like_cypher(value: &str) -> bool {
    value.len() >= MIN_QUERY_LEN && CYPHER_STATEMENT.is_match(value)
}

/// Replace format placeholders with the interpolation marker. Escaped braces
/// (`{{` / `}}`) are literal braces in the rendered statement.
fn normalize_format_literal(value: &str) -> String {
    let protected = value.replace("{{", "\u{1}").replace("}}", "\u{2}");
    let marked = FORMAT_PLACEHOLDER.replace_all(&protected, INTERPOLATED_MARKER);
    marked.replace('\u{1}', "{").replace('\u{2}', "}")
}

fn is_cfg_test(attrs: &[syn::Attribute]) -> bool {
    attrs.iter().any(|attr| {
        if !attr.path().is_ident("cfg") {
            return false;
        }
        match &attr.meta {
            syn::Meta::List(list) => list.tokens.to_string().contains("test"),
            _ => false,
        }
    })
}

struct QueryConstantCollector {
    constants: HashSet<String>,
}

impl QueryConstantCollector {
    fn record(&mut self, value: String) {
        if looks_like_cypher(&value) {
            self.constants.insert(value);
        }
    }

    fn collect_tokens(&mut self, tokens: proc_macro2::TokenStream) {
        for tree in tokens {
            match tree {
                TokenTree::Group(group) => self.collect_tokens(group.stream()),
                TokenTree::Literal(literal) => {
                    if let Ok(lit) = syn::parse_str::<syn::LitStr>(&literal.to_string()) {
                        self.record(normalize_format_literal(&lit.value()));
                    }
                }
                _ => {}
            }
        }
    }
}

impl<'ast> Visit<'ast> for QueryConstantCollector {
    fn visit_item_mod(&mut self, node: &'ast syn::ItemMod) {
        // Test modules exercise deliberately-invalid statements; the scanner
        // covers production constants only.
        if is_cfg_test(&node.attrs) {
            return;
        }
        syn::visit::visit_item_mod(self, node);
    }

    fn visit_lit_str(&mut self, node: &'ast syn::LitStr) {
        self.record(node.value());
    }

    fn visit_macro(&mut self, node: &'ast syn::Macro) {
        self.collect_tokens(node.tokens.clone());
        syn::visit::visit_macro(self, node);
    }
}

/// Static scanner proving the tenant-scope invariant over source trees.
#[derive(Debug, Clone)]
pub struct CypherTenantGuard {
    allowlist: HashSet<&'static str>,
}

impl Default for CypherTenantGuard {
    fn default() -> Self {
        Self {
            allowlist: SCHEMA_DDL_ALLOWLIST.clone(),
        }
    }
}

impl CypherTenantGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the subset of `queries` violating tenant scoping, sorted for
    /// stable reporting.
    pub fn scan_queries<'a, I>(&self, queries: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut violations: Vec<String> = queries
            .into_iter()
            .filter(|q| !self.is_exempt(q))
            .filter(|q| !query_references_tenant_id(q))
            .cloned()
            .collect();
        violations.sort();
        violations
    }

    fn is_exempt(&self, query: &str) -> bool {
        if self.allowlist.contains(query) || is_schema_ddl(query) {
            return true;
        }
        INTERNAL_NODE_PATTERN.is_match(query)
            || query.contains(INTERPOLATED_MARKER)
            || is_query_fragment(query)
            || ADMIN_MAINTENANCE_PATTERNS.iter().any(|p| p.is_match(query))
    }

    /// Extract query-shaped string constants from one source string.
    pub fn extract_from_source(&self, source: &str) -> HashSet<String> {
        let mut collector = QueryConstantCollector {
            constants: HashSet::new(),
        };
        match syn::parse_file(source) {
            Ok(file) => collector.visit_file(&file),
            Err(err) => tracing::warn!(%err, "skipping unparseable source"),
        }
        collector.constants
    }

    /// Recursively extract constants from every `.rs` file under `dir`.
    pub fn extract_from_directory(&self, dir: &Path) -> std::io::Result<HashSet<String>> {
        let mut constants = HashSet::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let mut entries: Vec<_> = std::fs::read_dir(&current)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .collect();
            entries.sort();
            for path in entries {
                if path.is_dir() {
                    if path.file_name().is_some_and(|n| n == "target") {
                        continue;
                    }
                    stack.push(path);
                } else if path.extension().is_some_and(|ext| ext == "rs") {
                    let source = std::fs::read_to_string(&path)?;
                    constants.extend(self.extract_from_source(&source));
                }
            }
        }
        Ok(constants)
    }
}

/// Unfinished query fragments awaiting composition are not statements.
fn is_query_fragment(query: &str) -> bool {
    let stripped = query.trim_end();
    stripped.ends_with(':')
        || stripped.ends_with('(')
        || stripped.ends_with(',')
        || stripped.ends_with('[')
}
