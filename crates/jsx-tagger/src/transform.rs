use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tree_sitter::{Language, Node, Parser};

use crate::id::generate_stable_id;
use crate::source_map::{JsxLocation, SourceMapManager};

/// Array iteration methods whose callbacks produce per-iteration elements.
const LOOP_METHODS: [&str; 8] = [
    "map", "forEach", "filter", "find", "findIndex", "some", "every", "flatMap",
];

/// Identifier inserted as the callback's index parameter when it has none.
const INDEX_PARAM: &str = "__jsx_idx__";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to load grammar: {0}")]
    Language(String),
    #[error("failed to parse {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Default)]
pub struct TaggerOptions {
    /// Prepended to every generated id as `"{prefix}-{hash}"`.
    pub id_prefix: Option<String>,
    /// Path fragments to leave untouched, in addition to `node_modules`.
    pub exclude: Vec<String>,
}

/// The tagging transform. One instance per build pipeline; the shared
/// [`SourceMapManager`] accumulates id -> location entries across files.
pub struct Tagger {
    options: TaggerOptions,
    map: Arc<SourceMapManager>,
}

/// A pending text insertion at a byte offset of the original source.
struct Edit {
    at: usize,
    text: String,
}

/// What we know about the loop callback enclosing an element.
struct CallbackInfo {
    node_id: usize,
    /// Identifier to suffix ids with; `None` means the callback's second
    /// parameter exists but is not a plain identifier, so tagging falls
    /// back to a static id.
    index_ident: Option<String>,
    /// Insertions that add the index parameter, queued at most once.
    param_edits: Vec<Edit>,
}

impl Tagger {
    pub fn new(options: TaggerOptions, map: Arc<SourceMapManager>) -> Self {
        Self { options, map }
    }

    pub fn source_map(&self) -> Arc<SourceMapManager> {
        self.map.clone()
    }

    /// Only `.jsx`/`.tsx` files outside `node_modules` and the exclude list
    /// are transformed.
    pub fn should_transform(&self, path: &str) -> bool {
        if !(path.ends_with(".jsx") || path.ends_with(".tsx")) {
            return false;
        }
        if path.contains("node_modules") {
            return false;
        }
        !self.options.exclude.iter().any(|frag| path.contains(frag))
    }

    /// Transform one file, annotating native elements and refreshing the
    /// source map entries for `path`. Returns `Ok(None)` when the file is
    /// out of scope.
    pub fn transform(&self, path: &str, source: &str) -> Result<Option<String>, TransformError> {
        if !self.should_transform(path) {
            return Ok(None);
        }

        let language = language_for(path);
        let mut parser = Parser::new();
        parser
            .set_language(&language)
            .map_err(|e| TransformError::Language(e.to_string()))?;
        let tree = parser
            .parse(source, None)
            .ok_or_else(|| TransformError::Parse(path.to_string()))?;

        let mut edits: Vec<Edit> = Vec::new();
        let mut entries: Vec<(String, JsxLocation)> = Vec::new();
        let mut callbacks: HashMap<usize, Option<String>> = HashMap::new();
        let mut patched_callbacks: HashSet<usize> = HashSet::new();

        let mut stack = vec![tree.root_node()];
        while let Some(node) = stack.pop() {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                stack.push(child);
            }

            if node.kind() != "jsx_opening_element" && node.kind() != "jsx_self_closing_element" {
                continue;
            }
            let Some(name_node) = node.child_by_field_name("name") else {
                // Fragment shorthand has no name.
                continue;
            };
            if name_node.kind() != "identifier" {
                continue;
            }
            let name = node_text(name_node, source);
            if !name.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
                continue;
            }
            if has_tag_attribute(node, source) {
                continue;
            }

            let point = node.start_position();
            let line = point.row as u32 + 1;
            let column = point.column as u32;
            let base_id =
                generate_stable_id(path, line, column, self.options.id_prefix.as_deref());

            let index_ident = match enclosing_loop_callback(node, source) {
                Some(info) => {
                    let ident = callbacks.entry(info.node_id).or_insert(info.index_ident);
                    if ident.is_some() && patched_callbacks.insert(info.node_id) {
                        edits.extend(info.param_edits);
                    }
                    ident.clone()
                }
                None => None,
            };

            let id_attr = match &index_ident {
                Some(ident) => format!(" data-jsx-id={{\"{base_id}-\" + {ident}}}"),
                None => format!(" data-jsx-id=\"{base_id}\""),
            };
            edits.push(Edit {
                at: name_node.end_byte(),
                text: format!(
                    "{id_attr} data-jsx-file=\"{path}\" data-jsx-line=\"{line}\" data-jsx-col=\"{column}\""
                ),
            });
            entries.push((
                base_id,
                JsxLocation {
                    file: path.to_string(),
                    line,
                    column,
                    element_name: name.to_string(),
                },
            ));
        }

        tracing::debug!(file = path, tagged = entries.len(), "tagged elements");
        self.map.replace_file(path, entries);
        Ok(Some(apply_edits(source, edits)))
    }
}

fn language_for(path: &str) -> Language {
    if path.ends_with(".tsx") {
        tree_sitter_typescript::LANGUAGE_TSX.into()
    } else {
        tree_sitter_javascript::LANGUAGE.into()
    }
}

fn node_text<'a>(node: Node, source: &'a str) -> &'a str {
    &source[node.start_byte()..node.end_byte()]
}

/// True when the opening element already carries `data-jsx-id`.
fn has_tag_attribute(element: Node, source: &str) -> bool {
    let mut cursor = element.walk();
    for child in element.children(&mut cursor) {
        if child.kind() != "jsx_attribute" {
            continue;
        }
        if let Some(attr_name) = child.named_child(0) {
            if node_text(attr_name, source) == "data-jsx-id" {
                return true;
            }
        }
    }
    false
}

fn is_function_kind(kind: &str) -> bool {
    matches!(kind, "arrow_function" | "function_expression" | "function")
}

/// Walk up from an element to the nearest enclosing function that is passed
/// directly as an argument to `X.<loop method>(...)`.
fn enclosing_loop_callback(element: Node, source: &str) -> Option<CallbackInfo> {
    let mut current = element.parent();
    while let Some(node) = current {
        if is_function_kind(node.kind()) && is_loop_callback(node, source) {
            return Some(analyze_callback(node, source));
        }
        current = node.parent();
    }
    None
}

fn is_loop_callback(function: Node, source: &str) -> bool {
    let Some(args) = function.parent() else {
        return false;
    };
    if args.kind() != "arguments" {
        return false;
    }
    let Some(call) = args.parent() else {
        return false;
    };
    if call.kind() != "call_expression" {
        return false;
    }
    let Some(callee) = call.child_by_field_name("function") else {
        return false;
    };
    if callee.kind() != "member_expression" {
        return false;
    }
    let Some(property) = callee.child_by_field_name("property") else {
        return false;
    };
    LOOP_METHODS.contains(&node_text(property, source))
}

/// Determine the callback's index identifier, inserting a second parameter
/// when it has none.
fn analyze_callback(function: Node, source: &str) -> CallbackInfo {
    let node_id = function.id();

    // Bare single-parameter arrow: `item => ...`. Wrap in parens and append
    // the index parameter.
    if let Some(param) = function.child_by_field_name("parameter") {
        return CallbackInfo {
            node_id,
            index_ident: Some(INDEX_PARAM.to_string()),
            param_edits: vec![
                Edit {
                    at: param.start_byte(),
                    text: "(".to_string(),
                },
                Edit {
                    at: param.end_byte(),
                    text: format!(", {INDEX_PARAM})"),
                },
            ],
        };
    }

    let Some(params) = function.child_by_field_name("parameters") else {
        return CallbackInfo {
            node_id,
            index_ident: None,
            param_edits: Vec::new(),
        };
    };

    let named: Vec<Node> = {
        let mut cursor = params.walk();
        params
            .named_children(&mut cursor)
            .filter(|n| n.kind() != "comment")
            .collect()
    };

    match named.len() {
        0 => CallbackInfo {
            node_id,
            index_ident: Some(INDEX_PARAM.to_string()),
            param_edits: vec![Edit {
                at: params.end_byte().saturating_sub(1),
                text: format!("_, {INDEX_PARAM}"),
            }],
        },
        1 => CallbackInfo {
            node_id,
            index_ident: Some(INDEX_PARAM.to_string()),
            param_edits: vec![Edit {
                at: named[0].end_byte(),
                text: format!(", {INDEX_PARAM}"),
            }],
        },
        _ => CallbackInfo {
            node_id,
            // An existing second parameter is reused only when it is a plain
            // identifier; destructured parameters keep the static id.
            index_ident: plain_identifier(named[1], source),
            param_edits: Vec::new(),
        },
    }
}

/// Resolve a parameter node to its identifier text, looking through the
/// TypeScript grammar's parameter wrappers.
fn plain_identifier(param: Node, source: &str) -> Option<String> {
    let target = match param.kind() {
        "required_parameter" | "optional_parameter" => param.child_by_field_name("pattern")?,
        _ => param,
    };
    if target.kind() == "identifier" {
        Some(node_text(target, source).to_string())
    } else {
        None
    }
}

fn apply_edits(source: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by(|a, b| b.at.cmp(&a.at));
    let mut out = source.to_string();
    for edit in edits {
        out.insert_str(edit.at, &edit.text);
    }
    out
}
