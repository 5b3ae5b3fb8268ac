//! Declaration listing for TypeScript/JavaScript and Python sources.
//!
//! Extraction is line-based pattern matching over declarations, good enough to
//! orient the model. Other languages get an explicit "unsupported" answer.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use super::read_file::{outside_workspace, read_text};
use super::{ListSymbolsInput, ToolContext, ToolOutcome};
use crate::core::path::resolve_workspace_path;
use crate::core::sanitize::truncate_chars;
use crate::io::sandbox::SandboxError;

/// Matches returned by a codebase search.
const MAX_CODEBASE_MATCHES: usize = 200;

const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "mts", "cts", "js", "jsx", "mjs", "cjs", "py"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    TypeScript,
    Python,
}

impl Language {
    fn from_path(path: &str) -> Option<Self> {
        let ext = path.rsplit_once('.').map(|(_, ext)| ext)?;
        match ext {
            "py" => Some(Language::Python),
            ext if SOURCE_EXTENSIONS.contains(&ext) => Some(Language::TypeScript),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Method,
    Class,
    Interface,
    Type,
    Enum,
    Variable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub line: usize,
}

static TS_PATTERNS: LazyLock<Vec<(SymbolKind, Regex)>> = LazyLock::new(|| {
    [
        (
            SymbolKind::Function,
            r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)",
        ),
        (
            SymbolKind::Class,
            r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][\w$]*)",
        ),
        (
            SymbolKind::Interface,
            r"^\s*(?:export\s+)?(?:declare\s+)?interface\s+([A-Za-z_$][\w$]*)",
        ),
        (
            SymbolKind::Type,
            r"^\s*(?:export\s+)?(?:declare\s+)?type\s+([A-Za-z_$][\w$]*)\s*(?:<[^=]*>)?\s*=",
        ),
        (
            SymbolKind::Enum,
            r"^\s*(?:export\s+)?(?:declare\s+)?(?:const\s+)?enum\s+([A-Za-z_$][\w$]*)",
        ),
        (
            SymbolKind::Function,
            r"^(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:function\b|\([^)]*\)\s*(?::[^=]+)?=>|[A-Za-z_$][\w$]*\s*=>)",
        ),
        (
            SymbolKind::Variable,
            r"^(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)",
        ),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("valid regex")))
    .collect()
});

static PY_DEF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)(?:async\s+)?def\s+([A-Za-z_]\w*)").expect("valid regex")
});
static PY_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)class\s+([A-Za-z_]\w*)").expect("valid regex"));
static PY_CONSTANT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z_][A-Z0-9_]*)\s*(?::[^=]+)?=[^=]").expect("valid regex")
});
static QUERY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,64}$").expect("valid regex"));

fn classify_line(language: Language, line: &str) -> Option<(SymbolKind, String)> {
    match language {
        Language::TypeScript => TS_PATTERNS.iter().find_map(|(kind, re)| {
            re.captures(line)
                .and_then(|caps| caps.get(1))
                .map(|name| (*kind, name.as_str().to_string()))
        }),
        Language::Python => {
            if let Some(caps) = PY_DEF.captures(line) {
                let kind = if caps[1].is_empty() {
                    SymbolKind::Function
                } else {
                    SymbolKind::Method
                };
                return Some((kind, caps[2].to_string()));
            }
            if let Some(caps) = PY_CLASS.captures(line) {
                return Some((SymbolKind::Class, caps[2].to_string()));
            }
            PY_CONSTANT
                .captures(line)
                .map(|caps| (SymbolKind::Variable, caps[1].to_string()))
        }
    }
}

/// Declarations in `source`, in file order. `None` for unsupported languages.
pub fn extract_symbols(path: &str, source: &str) -> Option<Vec<Symbol>> {
    let language = Language::from_path(path)?;
    let symbols = source
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            classify_line(language, line).map(|(kind, name)| Symbol {
                name,
                kind,
                line: idx + 1,
            })
        })
        .collect();
    Some(symbols)
}

pub(super) fn run(
    input: &ListSymbolsInput,
    ctx: &ToolContext<'_>,
) -> Result<ToolOutcome, SandboxError> {
    match input {
        ListSymbolsInput::Document { path } => document(path, ctx),
        ListSymbolsInput::Codebase { query } => codebase(query, ctx),
    }
}

fn document(path: &str, ctx: &ToolContext<'_>) -> Result<ToolOutcome, SandboxError> {
    if Language::from_path(path).is_none() {
        return Ok(unsupported(path));
    }
    let Some(resolved) = resolve_workspace_path(path, ctx.workspace_dir) else {
        return Ok(ToolOutcome::Rejected(outside_workspace(path, ctx.workspace_dir)));
    };
    let source = read_text(ctx, &resolved)?;
    let symbols = extract_symbols(path, &source).unwrap_or_default();
    debug!(path = %resolved, symbols = symbols.len(), "listed document symbols");
    let body = json!({ "scope": "document", "path": path, "symbols": symbols });
    Ok(ToolOutcome::Output(truncate_chars(&body.to_string(), ctx.observation_limit)))
}

fn codebase(query: &str, ctx: &ToolContext<'_>) -> Result<ToolOutcome, SandboxError> {
    if !QUERY_RE.is_match(query) {
        return Ok(ToolOutcome::Rejected(
            "Codebase symbol queries must be a single identifier fragment (letters, digits, underscore)."
                .to_string(),
        ));
    }
    let includes: String = SOURCE_EXTENSIONS
        .iter()
        .map(|ext| format!(" --include='*.{ext}'"))
        .collect();
    let command = format!(
        "grep -rniE{includes} --exclude-dir=node_modules --exclude-dir=.git --exclude-dir=dist \
         '(function|class|interface|type|enum|def|const|let|var)[[:space:]]+[A-Za-z0-9_$]*{query}' . \
         | head -n {MAX_CODEBASE_MATCHES}"
    );
    let result = ctx
        .sandbox
        .execute_command(&command, ctx.workspace_dir, ctx.command_timeout)?;
    let output = String::from_utf8_lossy(&result.output);

    let needle = query.to_lowercase();
    let matches: Vec<_> = output
        .lines()
        .filter_map(parse_grep_line)
        .filter_map(|(path, line_no, text)| {
            let language = Language::from_path(path)?;
            let (kind, name) = classify_line(language, text)?;
            name.to_lowercase().contains(&needle).then(|| {
                json!({ "path": path, "line": line_no, "name": name, "kind": kind })
            })
        })
        .collect();
    debug!(query, matches = matches.len(), "searched codebase symbols");
    let body = json!({ "scope": "codebase", "query": query, "symbols": matches });
    Ok(ToolOutcome::Output(truncate_chars(&body.to_string(), ctx.observation_limit)))
}

/// Split `./path:line:text` grep output.
fn parse_grep_line(line: &str) -> Option<(&str, usize, &str)> {
    let (path, rest) = line.split_once(':')?;
    let (line_no, text) = rest.split_once(':')?;
    let line_no = line_no.parse().ok()?;
    Some((path.trim_start_matches("./"), line_no, text))
}

fn unsupported(path: &str) -> ToolOutcome {
    ToolOutcome::Output(
        json!({
            "supported": false,
            "path": path,
            "reason": "listSymbols supports TypeScript, JavaScript and Python sources only; use readFile or terminalCommand instead",
        })
        .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::docs::NoDocs;
    use crate::test_support::MemorySandbox;
    use std::time::Duration;

    fn ctx<'a>(sandbox: &'a MemorySandbox, docs: &'a NoDocs) -> ToolContext<'a> {
        ToolContext {
            sandbox,
            docs,
            workspace_dir: "workspace/repo",
            command_timeout: Duration::from_secs(5),
            observation_limit: 4_000,
        }
    }

    #[test]
    fn extracts_typescript_declarations() {
        let source = "\
import { x } from './x';
export async function signIn(provider: string) {}
export default class AuthClient {}
interface Session { user: string }
export type Provider<T> = { id: T };
export const enum Role { Admin }
export const handler = async (req: Request) => {};
const MAX_RETRIES = 3;
";
        let symbols = extract_symbols("src/auth.ts", source).expect("supported");
        let names: Vec<(&str, SymbolKind, usize)> = symbols
            .iter()
            .map(|s| (s.name.as_str(), s.kind, s.line))
            .collect();
        assert_eq!(
            names,
            vec![
                ("signIn", SymbolKind::Function, 2),
                ("AuthClient", SymbolKind::Class, 3),
                ("Session", SymbolKind::Interface, 4),
                ("Provider", SymbolKind::Type, 5),
                ("Role", SymbolKind::Enum, 6),
                ("handler", SymbolKind::Function, 7),
                ("MAX_RETRIES", SymbolKind::Variable, 8),
            ]
        );
    }

    #[test]
    fn extracts_python_declarations() {
        let source = "\
TIMEOUT = 30
class LoginView:
    def post(self, request):
        pass
async def refresh_token(user):
    pass
";
        let symbols = extract_symbols("app/views.py", source).expect("supported");
        let names: Vec<(&str, SymbolKind)> =
            symbols.iter().map(|s| (s.name.as_str(), s.kind)).collect();
        assert_eq!(
            names,
            vec![
                ("TIMEOUT", SymbolKind::Variable),
                ("LoginView", SymbolKind::Class),
                ("post", SymbolKind::Method),
                ("refresh_token", SymbolKind::Function),
            ]
        );
    }

    #[test]
    fn other_languages_are_reported_unsupported() {
        assert_eq!(extract_symbols("main.go", "func main() {}"), None);

        let sandbox = MemorySandbox::new("sb-1");
        let docs = NoDocs;
        let outcome = run(
            &ListSymbolsInput::Document {
                path: "cmd/main.go".to_string(),
            },
            &ctx(&sandbox, &docs),
        )
        .expect("run");
        let ToolOutcome::Output(text) = outcome else {
            panic!("expected output");
        };
        assert!(text.contains("\"supported\":false"), "{text}");
    }

    #[test]
    fn document_scope_reads_through_the_sandbox() {
        let sandbox = MemorySandbox::new("sb-1").with_file(
            "workspace/repo/src/login.ts",
            "export function login() {}\n",
        );
        let docs = NoDocs;
        let outcome = run(
            &ListSymbolsInput::Document {
                path: "src/login.ts".to_string(),
            },
            &ctx(&sandbox, &docs),
        )
        .expect("run");
        let ToolOutcome::Output(text) = outcome else {
            panic!("expected output");
        };
        assert!(text.contains("\"name\":\"login\""), "{text}");
    }

    #[test]
    fn codebase_scope_parses_grep_matches() {
        let sandbox = MemorySandbox::new("sb-1").with_command_prefix(
            "grep -rniE",
            0,
            "./src/login.ts:4:export function loginWithGithub() {\n./app/auth.py:10:def login_user(req):\n./README.md:1:login docs\n",
        );
        let docs = NoDocs;
        let outcome = run(
            &ListSymbolsInput::Codebase {
                query: "login".to_string(),
            },
            &ctx(&sandbox, &docs),
        )
        .expect("run");
        let ToolOutcome::Output(text) = outcome else {
            panic!("expected output");
        };
        assert!(text.contains("\"name\":\"loginWithGithub\""), "{text}");
        assert!(text.contains("\"name\":\"login_user\""), "{text}");
        assert!(!text.contains("README"), "{text}");
    }

    #[test]
    fn codebase_queries_must_be_identifiers() {
        let sandbox = MemorySandbox::new("sb-1");
        let docs = NoDocs;
        let outcome = run(
            &ListSymbolsInput::Codebase {
                query: "x'; rm -rf /".to_string(),
            },
            &ctx(&sandbox, &docs),
        )
        .expect("run");
        assert!(matches!(outcome, ToolOutcome::Rejected(_)));
        assert!(sandbox.executed().is_empty());
    }
}
