//! Sandboxed template renderer.
//!
//! Templates substitute `{{var}}` placeholders through an optional filter
//! pipeline (`{{name|truncate_words(5)}}`) and support `{% if %}` /
//! `{% for %}` blocks. There is no dynamic code execution: evaluation only
//! ever touches the variable map passed in, never files, network or
//! environment.
//!
//! Filter arguments may be quoted strings, numbers, or the identifier
//! `locale`, which binds to the rendering locale.

use serde_json::Value;

use crate::db::models::{Template, VariableSchema};
use crate::i18n;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RenderError {
    #[error("Template syntax error: {0}")]
    Syntax(String),

    #[error("Missing required variable: {0}")]
    MissingVariable(String),

    #[error("Filter {filter} cannot be applied: expected {expected}")]
    TypeMismatch { filter: String, expected: String },

    #[error("Unknown filter: {0}")]
    UnknownFilter(String),
}

/// Rendered subject and body, direction-marked for RTL locales.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterArg {
    Str(String),
    Number(f64),
    Locale,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterCall {
    pub name: String,
    pub args: Vec<FilterArg>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    Output {
        path: String,
        filters: Vec<FilterCall>,
    },
    If {
        path: String,
        negated: bool,
        then_body: Vec<Node>,
        else_body: Vec<Node>,
    },
    For {
        var: String,
        path: String,
        body: Vec<Node>,
    },
}

/// A parsed template body.
#[derive(Debug, Clone, PartialEq)]
pub struct Ast {
    pub nodes: Vec<Node>,
}

impl Ast {
    /// Variable names referenced anywhere in the template (first path
    /// segment only; loop-bound names are excluded).
    pub fn referenced_variables(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_refs(&self.nodes, &mut Vec::new(), &mut names);
        names.sort();
        names.dedup();
        names
    }
}

fn collect_refs(nodes: &[Node], bound: &mut Vec<String>, out: &mut Vec<String>) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Output { path, .. } => push_root(path, bound, out),
            Node::If {
                path,
                then_body,
                else_body,
                ..
            } => {
                push_root(path, bound, out);
                collect_refs(then_body, bound, out);
                collect_refs(else_body, bound, out);
            }
            Node::For { var, path, body } => {
                push_root(path, bound, out);
                bound.push(var.clone());
                collect_refs(body, bound, out);
                bound.pop();
            }
        }
    }
}

fn push_root(path: &str, bound: &[String], out: &mut Vec<String>) {
    let root = path.split('.').next().unwrap_or(path);
    if !bound.iter().any(|b| b == root) {
        out.push(root.to_string());
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

enum Token {
    Text(String),
    Output(String),
    Tag(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>, RenderError> {
    let mut tokens = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        let next_output = rest.find("{{");
        let next_tag = rest.find("{%");

        let (pos, is_tag) = match (next_output, next_tag) {
            (Some(o), Some(t)) if t < o => (t, true),
            (Some(o), _) => (o, false),
            (None, Some(t)) => (t, true),
            (None, None) => {
                tokens.push(Token::Text(rest.to_string()));
                break;
            }
        };

        if pos > 0 {
            tokens.push(Token::Text(rest[..pos].to_string()));
        }

        let close = if is_tag { "%}" } else { "}}" };
        let open_len = 2;
        let after_open = &rest[pos + open_len..];
        let end = after_open
            .find(close)
            .ok_or_else(|| RenderError::Syntax(format!("Unclosed {}", if is_tag { "{%" } else { "{{" })))?;

        let inner = after_open[..end].trim().to_string();
        if is_tag {
            tokens.push(Token::Tag(inner));
        } else {
            tokens.push(Token::Output(inner));
        }

        rest = &after_open[end + close.len()..];
    }

    Ok(tokens)
}

/// Parse a template string into an AST.
pub fn parse(input: &str) -> Result<Ast, RenderError> {
    let tokens = tokenize(input)?;
    let mut iter = tokens.into_iter().peekable();
    let nodes = parse_nodes(&mut iter, None)?;
    Ok(Ast { nodes })
}

fn parse_nodes(
    iter: &mut std::iter::Peekable<std::vec::IntoIter<Token>>,
    until: Option<&[&str]>,
) -> Result<Vec<Node>, RenderError> {
    let mut nodes = Vec::new();

    while let Some(token) = iter.peek() {
        if let (Token::Tag(tag), Some(stops)) = (token, until) {
            let word = tag.split_whitespace().next().unwrap_or("");
            if stops.contains(&word) {
                return Ok(nodes);
            }
        }

        let token = iter.next().unwrap();
        match token {
            Token::Text(text) => nodes.push(Node::Text(text)),
            Token::Output(inner) => nodes.push(parse_output(&inner)?),
            Token::Tag(tag) => {
                let mut words = tag.split_whitespace();
                match words.next() {
                    Some("if") => {
                        let mut cond: Vec<&str> = words.collect();
                        let negated = cond.first() == Some(&"not");
                        if negated {
                            cond.remove(0);
                        }
                        if cond.len() != 1 {
                            return Err(RenderError::Syntax(format!(
                                "Bad if condition: {}",
                                tag
                            )));
                        }
                        let path = validate_path(cond[0])?;

                        let then_body = parse_nodes(iter, Some(&["else", "endif"]))?;
                        let else_body = match iter.next() {
                            Some(Token::Tag(t)) if t == "else" => {
                                let body = parse_nodes(iter, Some(&["endif"]))?;
                                match iter.next() {
                                    Some(Token::Tag(t)) if t == "endif" => body,
                                    _ => {
                                        return Err(RenderError::Syntax(
                                            "Missing {% endif %}".to_string(),
                                        ))
                                    }
                                }
                            }
                            Some(Token::Tag(t)) if t == "endif" => Vec::new(),
                            _ => {
                                return Err(RenderError::Syntax(
                                    "Missing {% endif %}".to_string(),
                                ))
                            }
                        };

                        nodes.push(Node::If {
                            path,
                            negated,
                            then_body,
                            else_body,
                        });
                    }
                    Some("for") => {
                        let parts: Vec<&str> = words.collect();
                        if parts.len() != 3 || parts[1] != "in" {
                            return Err(RenderError::Syntax(format!("Bad for loop: {}", tag)));
                        }
                        let var = validate_path(parts[0])?;
                        let path = validate_path(parts[2])?;

                        let body = parse_nodes(iter, Some(&["endfor"]))?;
                        match iter.next() {
                            Some(Token::Tag(t)) if t == "endfor" => {}
                            _ => {
                                return Err(RenderError::Syntax(
                                    "Missing {% endfor %}".to_string(),
                                ))
                            }
                        }

                        nodes.push(Node::For { var, path, body });
                    }
                    Some(other) => {
                        return Err(RenderError::Syntax(format!("Unknown tag: {}", other)))
                    }
                    None => return Err(RenderError::Syntax("Empty tag".to_string())),
                }
            }
        }
    }

    if until.is_some() {
        return Err(RenderError::Syntax("Unterminated block".to_string()));
    }
    Ok(nodes)
}

fn parse_output(inner: &str) -> Result<Node, RenderError> {
    let mut parts = split_pipeline(inner);
    if parts.is_empty() {
        return Err(RenderError::Syntax("Empty placeholder".to_string()));
    }
    let path = validate_path(parts.remove(0).trim())?;

    let mut filters = Vec::new();
    for part in parts {
        filters.push(parse_filter(part.trim())?);
    }
    Ok(Node::Output { path, filters })
}

/// Split on '|' outside of quotes.
fn split_pipeline(inner: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quote: Option<char> = None;
    for (i, c) in inner.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '|' => {
                parts.push(&inner[start..i]);
                start = i + 1;
            }
            None => {}
        }
    }
    parts.push(&inner[start..]);
    parts
}

fn parse_filter(spec: &str) -> Result<FilterCall, RenderError> {
    let (name, args_str) = match spec.find('(') {
        Some(open) => {
            if !spec.ends_with(')') {
                return Err(RenderError::Syntax(format!("Bad filter call: {}", spec)));
            }
            (&spec[..open], Some(&spec[open + 1..spec.len() - 1]))
        }
        None => (spec, None),
    };

    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(RenderError::Syntax(format!("Bad filter name: {}", spec)));
    }

    let mut args = Vec::new();
    if let Some(args_str) = args_str {
        for raw in split_args(args_str) {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
                || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
            {
                args.push(FilterArg::Str(raw[1..raw.len() - 1].to_string()));
            } else if raw == "locale" {
                args.push(FilterArg::Locale);
            } else if let Ok(n) = raw.parse::<f64>() {
                args.push(FilterArg::Number(n));
            } else {
                return Err(RenderError::Syntax(format!("Bad filter argument: {}", raw)));
            }
        }
    }

    Ok(FilterCall {
        name: name.to_string(),
        args,
    })
}

fn split_args(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quote: Option<char> = None;
    for (i, c) in input.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == ',' => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            None => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn validate_path(path: &str) -> Result<String, RenderError> {
    let ok = !path.is_empty()
        && path.split('.').all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if ok {
        Ok(path.to_string())
    } else {
        Err(RenderError::Syntax(format!("Bad variable path: {}", path)))
    }
}

// ---------------------------------------------------------------------------
// Serialization (canonical template text)
// ---------------------------------------------------------------------------

/// Reconstruct canonical template text from an AST. Re-parsing the output
/// yields an equal AST.
pub fn serialize(ast: &Ast) -> String {
    let mut out = String::new();
    serialize_nodes(&ast.nodes, &mut out);
    out
}

fn serialize_nodes(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Output { path, filters } => {
                out.push_str("{{");
                out.push_str(path);
                for f in filters {
                    out.push('|');
                    out.push_str(&f.name);
                    if !f.args.is_empty() {
                        out.push('(');
                        let args: Vec<String> = f
                            .args
                            .iter()
                            .map(|a| match a {
                                FilterArg::Str(s) => format!("\"{}\"", s),
                                FilterArg::Number(n) => {
                                    if n.fract() == 0.0 {
                                        format!("{}", *n as i64)
                                    } else {
                                        format!("{}", n)
                                    }
                                }
                                FilterArg::Locale => "locale".to_string(),
                            })
                            .collect();
                        out.push_str(&args.join(", "));
                        out.push(')');
                    }
                }
                out.push_str("}}");
            }
            Node::If {
                path,
                negated,
                then_body,
                else_body,
            } => {
                out.push_str("{% if ");
                if *negated {
                    out.push_str("not ");
                }
                out.push_str(path);
                out.push_str(" %}");
                serialize_nodes(then_body, out);
                if !else_body.is_empty() {
                    out.push_str("{% else %}");
                    serialize_nodes(else_body, out);
                }
                out.push_str("{% endif %}");
            }
            Node::For { var, path, body } => {
                out.push_str("{% for ");
                out.push_str(var);
                out.push_str(" in ");
                out.push_str(path);
                out.push_str(" %}");
                serialize_nodes(body, out);
                out.push_str("{% endfor %}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

struct RenderCtx<'a> {
    vars: &'a Value,
    schema: &'a VariableSchema,
    locale: &'a str,
    scopes: Vec<(String, Value)>,
}

impl<'a> RenderCtx<'a> {
    fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let root = segments.next()?;

        let mut current = self
            .scopes
            .iter()
            .rev()
            .find(|(name, _)| name == root)
            .map(|(_, v)| v.clone())
            .or_else(|| self.vars.get(root).cloned())?;

        for seg in segments {
            current = current.get(seg)?.clone();
        }
        Some(current)
    }
}

/// Render a parsed template with a variable map.
pub fn render(
    ast: &Ast,
    vars: &Value,
    schema: &VariableSchema,
    locale: &str,
) -> Result<String, RenderError> {
    let mut ctx = RenderCtx {
        vars,
        schema,
        locale,
        scopes: Vec::new(),
    };
    let mut out = String::new();
    render_nodes(&ast.nodes, &mut ctx, &mut out)?;
    Ok(out)
}

/// Parse and render a template string in one call.
pub fn render_str(
    template: &str,
    vars: &Value,
    schema: &VariableSchema,
    locale: &str,
) -> Result<String, RenderError> {
    render(&parse(template)?, vars, schema, locale)
}

/// Render a stored template's subject and body, wrapping RTL locales in
/// direction markers.
pub fn render_template(
    template: &Template,
    vars: &Value,
    locale: &str,
) -> Result<Rendered, RenderError> {
    let schema = template.schema();
    let subject = template
        .subject
        .as_deref()
        .map(|s| render_str(s, vars, &schema, locale))
        .transpose()?
        .map(|s| i18n::with_direction(locale, s));
    let body = i18n::with_direction(locale, render_str(&template.body, vars, &schema, locale)?);
    Ok(Rendered { subject, body })
}

/// Validate a template at create/update time: it must parse, and every
/// schema-required variable must be referenced at least once.
pub fn validate(body: &str, subject: Option<&str>, schema: &VariableSchema) -> Result<(), RenderError> {
    let mut referenced = parse(body)?.referenced_variables();
    if let Some(subject) = subject {
        referenced.extend(parse(subject)?.referenced_variables());
    }

    for (name, spec) in schema {
        if spec.required && !referenced.iter().any(|r| r == name) {
            return Err(RenderError::Syntax(format!(
                "Required variable never referenced: {}",
                name
            )));
        }
    }
    Ok(())
}

fn render_nodes(
    nodes: &[Node],
    ctx: &mut RenderCtx,
    out: &mut String,
) -> Result<(), RenderError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Output { path, filters } => {
                let value = resolve_output(path, ctx)?;
                let mut value = match value {
                    Some(v) => v,
                    None => Value::String(String::new()),
                };
                for filter in filters {
                    value = apply_filter(filter, value, ctx.locale)?;
                }
                out.push_str(&value_to_string(&value));
            }
            Node::If {
                path,
                negated,
                then_body,
                else_body,
            } => {
                let truthy = ctx.lookup(path).map(|v| is_truthy(&v)).unwrap_or(false);
                let branch = if truthy != *negated { then_body } else { else_body };
                render_nodes(branch, ctx, out)?;
            }
            Node::For { var, path, body } => {
                let list = ctx.lookup(path).unwrap_or(Value::Null);
                let items = match list {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    _ => {
                        return Err(RenderError::TypeMismatch {
                            filter: "for".to_string(),
                            expected: "list".to_string(),
                        })
                    }
                };
                for item in items {
                    ctx.scopes.push((var.clone(), item));
                    let result = render_nodes(body, ctx, out);
                    ctx.scopes.pop();
                    result?;
                }
            }
        }
    }
    Ok(())
}

fn resolve_output(path: &str, ctx: &RenderCtx) -> Result<Option<Value>, RenderError> {
    match ctx.lookup(path) {
        Some(v) => Ok(Some(v)),
        None => {
            let root = path.split('.').next().unwrap_or(path);
            let required = ctx
                .schema
                .get(root)
                .map(|spec| spec.required)
                .unwrap_or(false);
            if required {
                Err(RenderError::MissingVariable(root.to_string()))
            } else {
                Ok(None)
            }
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

fn apply_filter(call: &FilterCall, value: Value, locale: &str) -> Result<Value, RenderError> {
    let arg_str = |idx: usize| -> Option<String> {
        call.args.get(idx).map(|a| match a {
            FilterArg::Str(s) => s.clone(),
            FilterArg::Number(n) => n.to_string(),
            FilterArg::Locale => locale.to_string(),
        })
    };

    match call.name.as_str() {
        "truncate_words" => {
            let limit = match call.args.first() {
                Some(FilterArg::Number(n)) => *n as usize,
                _ => 50,
            };
            let text = as_string(&value, "truncate_words")?;
            let words: Vec<&str> = text.split_whitespace().collect();
            let out = if words.len() > limit {
                format!("{}...", words[..limit].join(" "))
            } else {
                text
            };
            Ok(Value::String(out))
        }
        "format_date" => {
            let style = arg_str(0).unwrap_or_else(|| "medium".to_string());
            let date_locale = arg_str(1).unwrap_or_else(|| locale.to_string());
            let text = as_string(&value, "format_date")?;
            let parsed = parse_datetime(&text).ok_or(RenderError::TypeMismatch {
                filter: "format_date".to_string(),
                expected: "ISO-8601 date".to_string(),
            })?;
            Ok(Value::String(format_date(parsed, &style, &date_locale)))
        }
        "format_number" => {
            let num_locale = arg_str(0).unwrap_or_else(|| locale.to_string());
            let n = as_number(&value, "format_number")?;
            Ok(Value::String(format_number(n, &num_locale)))
        }
        "format_currency" => {
            let code = arg_str(0).unwrap_or_else(|| "USD".to_string());
            let cur_locale = arg_str(1).unwrap_or_else(|| locale.to_string());
            let n = as_number(&value, "format_currency")?;
            let formatted = format!(
                "{} {}",
                i18n::currency_symbol(&code),
                format_decimal(n, 2, &cur_locale)
            );
            Ok(Value::String(formatted))
        }
        "sanitize_html" => {
            let text = as_string(&value, "sanitize_html")?;
            Ok(Value::String(escape_html(&text)))
        }
        "to_json" => {
            let encoded = serde_json::to_string(&value).map_err(|_| RenderError::TypeMismatch {
                filter: "to_json".to_string(),
                expected: "serializable value".to_string(),
            })?;
            Ok(Value::String(encoded))
        }
        "arabic_number" => {
            let text = value_to_string(&value);
            Ok(Value::String(i18n::arabic_digits(&text)))
        }
        other => Err(RenderError::UnknownFilter(other.to_string())),
    }
}

fn as_string(value: &Value, filter: &str) -> Result<String, RenderError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(RenderError::TypeMismatch {
            filter: filter.to_string(),
            expected: "string".to_string(),
        }),
    }
}

fn as_number(value: &Value, filter: &str) -> Result<f64, RenderError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or(RenderError::TypeMismatch {
            filter: filter.to_string(),
            expected: "number".to_string(),
        }),
        Value::String(s) => s.parse().map_err(|_| RenderError::TypeMismatch {
            filter: filter.to_string(),
            expected: "number".to_string(),
        }),
        _ => Err(RenderError::TypeMismatch {
            filter: filter.to_string(),
            expected: "number".to_string(),
        }),
    }
}

fn parse_datetime(text: &str) -> Option<chrono::NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(dt);
    }
    chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(chrono::NaiveTime::MIN))
}

fn format_date(dt: chrono::NaiveDateTime, style: &str, locale: &str) -> String {
    use chrono::Datelike;
    let formatted = match style {
        "short" => format!("{:02}/{:02}/{}", dt.day(), dt.month(), dt.year()),
        "long" => format!(
            "{} {} {}",
            dt.day(),
            i18n::month_name(locale, dt.month(), false),
            dt.year()
        ),
        _ => format!(
            "{} {} {}",
            dt.day(),
            i18n::month_name(locale, dt.month(), true),
            dt.year()
        ),
    };
    if i18n::is_rtl(locale) {
        i18n::arabic_digits(&formatted)
    } else {
        formatted
    }
}

fn format_number(n: f64, locale: &str) -> String {
    if n.fract() == 0.0 {
        format_decimal(n, 0, locale)
    } else {
        format_decimal(n, 2, locale)
    }
}

fn format_decimal(n: f64, places: usize, locale: &str) -> String {
    let (thousands, decimal) = i18n::number_separators(locale);
    let negative = n < 0.0;
    let formatted = format!("{:.*}", places, n.abs());
    let mut parts = formatted.splitn(2, '.');
    let int_part = parts.next().unwrap_or("0");
    let frac_part = parts.next();

    let mut grouped = String::new();
    let digits: Vec<char> = int_part.chars().collect();
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(thousands);
        }
        grouped.push(*c);
    }

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(&grouped);
    if let Some(frac) = frac_part {
        out.push(decimal);
        out.push_str(frac);
    }
    if i18n::is_rtl(locale) {
        i18n::arabic_digits(&out)
    } else {
        out
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}
