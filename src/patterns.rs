//! # Capture Patterns
//!
//! The engine resolves required paths to build steps by matching them
//! against *capture patterns*: path strings with named holes.
//!
//! - `{name}` is an **interpolation hole**, substituted from an ambient
//!   binding map before matching.
//! - `{*name}` is a **captured parameter** matching a filename-safe run of
//!   at least one character (no `/`), bound to `name`.
//! - `{**name}` is a captured parameter matching any run of at least one
//!   character, possibly spanning `/`.
//! - `{_name}`, `{*_name}` and `{**_name}` are **non-captured** wildcards: a
//!   hole whose name starts with `_` matches like its captured counterpart
//!   but the matched value is discarded. Steps use these to declare *dynamic
//!   outputs* whose concrete names are only learned after execution.
//!
//! A pattern is *capturing* iff it contains at least one capturing hole and
//! *dynamic* iff it contains a non-captured wildcard hole. Literal `{` and
//! `}` are written `{{` and `}}`.
//!
//! ## Operations
//!
//! - [`Pattern::match_path`] extracts the captured bindings from a path.
//! - [`format_pattern`] substitutes every hole from a binding map.
//! - [`Pattern::glob`] finds the existing paths matching a pattern, in
//!   lexicographic order, together with their bindings.
//! - [`Pattern::glob_fmt`] formats a template once per glob match.
//! - [`fmt`] and [`fmt_capture`] expand interpolation holes in templates,
//!   preserving annotations; `fmt_capture` additionally expands captured
//!   holes whose names are bound, which is how a step's output patterns are
//!   resolved against its own bindings.

use std::collections::BTreeMap;

use regex::Regex;
use walkdir::WalkDir;

use crate::annotations::APath;
use crate::error::{Error, Result};
use crate::stat::StatCache;

/// Captured parameter values, keyed by hole name.
pub type Bindings = BTreeMap<String, String>;

/// The results of matching a glob pattern against the filesystem.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    /// The existing paths that matched, in lexicographic order, carrying the
    /// pattern's annotations.
    pub paths: Vec<APath>,
    /// The bindings captured from each matched path, in the same order.
    pub bindings: Vec<Bindings>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Literal text (unescaped).
    Literal(String),
    /// `{name}` interpolation hole.
    Interp(String),
    /// `{*name}` and friends.
    Hole {
        name: String,
        deep: bool,
        captured: bool,
    },
}

fn invalid(pattern: &str, index: usize, reason: &str) -> Error {
    Error::Pattern {
        pattern: pattern.to_owned(),
        message: format!("at offset {index}: {reason}"),
    }
}

fn parse_tokens(pattern: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut literal = String::new();
    let mut index = 0;

    let push_literal = |literal: &mut String, tokens: &mut Vec<Token>| {
        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(literal)));
        }
    };

    while index < chars.len() {
        let char = chars[index];
        index += 1;

        if char == '}' {
            if index < chars.len() && chars[index] == '}' {
                literal.push('}');
                index += 1;
            } else {
                literal.push('}');
            }
            continue;
        }

        if char != '{' {
            literal.push(char);
            continue;
        }

        if index < chars.len() && chars[index] == '{' {
            literal.push('{');
            index += 1;
            continue;
        }

        let mut stars = 0;
        while index < chars.len() && chars[index] == '*' {
            stars += 1;
            index += 1;
        }
        if stars > 2 {
            return Err(invalid(pattern, index, "too many stars"));
        }

        let name_start = index;
        while index < chars.len() && chars[index] != '}' {
            let char = chars[index];
            if char != '_' && !char.is_ascii_alphanumeric() {
                return Err(invalid(pattern, index, "invalid name character"));
            }
            index += 1;
        }
        if index == name_start {
            return Err(invalid(pattern, index, "empty name"));
        }
        if index >= chars.len() {
            return Err(invalid(pattern, index, "missing }"));
        }
        let name: String = chars[name_start..index].iter().collect();
        index += 1;

        push_literal(&mut literal, &mut tokens);
        let non_captured = name.starts_with('_');
        if stars == 0 && !non_captured {
            tokens.push(Token::Interp(name));
        } else {
            tokens.push(Token::Hole {
                name,
                deep: stars == 2,
                captured: !non_captured,
            });
        }
    }

    push_literal(&mut literal, &mut tokens);
    Ok(tokens)
}

/// Re-serialize a literal so the result can be parsed again as a pattern.
fn escape_literal(text: &str) -> String {
    text.replace('{', "{{").replace('}', "}}")
}

fn serialize_tokens(tokens: &[Token]) -> String {
    let mut result = String::new();
    for token in tokens {
        match token {
            Token::Literal(text) => result.push_str(&escape_literal(text)),
            Token::Interp(name) => {
                result.push('{');
                result.push_str(name);
                result.push('}');
            }
            Token::Hole { name, deep, .. } => {
                result.push('{');
                result.push_str(if *deep { "**" } else { "*" });
                result.push_str(name);
                result.push('}');
            }
        }
    }
    result
}

/// A compiled capture pattern.
///
/// Interpolation holes must be expanded (via [`fmt_capture`]) before a
/// pattern is compiled; only capturing and non-captured wildcard holes
/// remain at this point.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: APath,
    regex: Regex,
    captures: Vec<String>,
    dynamic: bool,
    literal_prefix: String,
}

impl Pattern {
    /// Compile a pattern string.
    ///
    /// # Examples
    ///
    /// ```
    /// use dynamake::patterns::Pattern;
    ///
    /// let pattern = Pattern::new("obj/{*name}.o").unwrap();
    /// let bindings = pattern.match_path("obj/main.o").unwrap();
    /// assert_eq!(bindings["name"], "main");
    /// assert!(pattern.match_path("obj/sub/main.o").is_none());
    /// ```
    pub fn new(source: impl Into<APath>) -> Result<Pattern> {
        let source = source.into();
        let tokens = parse_tokens(source.as_str())?;

        let mut regex_text = String::from("^");
        let mut captures: Vec<String> = Vec::new();
        let mut dynamic = false;
        let mut literal_prefix = String::new();
        let mut before_first_hole = true;

        for token in &tokens {
            match token {
                Token::Literal(text) => {
                    regex_text.push_str(&regex::escape(text));
                    if before_first_hole {
                        literal_prefix.push_str(text);
                    }
                }
                Token::Interp(name) => {
                    return Err(Error::Pattern {
                        pattern: source.as_str().to_owned(),
                        message: format!("unexpanded interpolation hole: {{{name}}}"),
                    });
                }
                Token::Hole {
                    name,
                    deep,
                    captured,
                } => {
                    before_first_hole = false;
                    let body = if *deep { ".+" } else { "[^/]+?" };
                    if *captured {
                        if captures.iter().any(|existing| existing == name) {
                            return Err(Error::Pattern {
                                pattern: source.as_str().to_owned(),
                                message: format!("duplicate captured name: {name}"),
                            });
                        }
                        captures.push(name.clone());
                        regex_text.push_str(&format!("(?P<{name}>{body})"));
                    } else {
                        dynamic = true;
                        regex_text.push_str(&format!("(?:{body})"));
                    }
                }
            }
        }
        regex_text.push('$');

        let regex = Regex::new(&regex_text).map_err(|error| Error::Pattern {
            pattern: source.as_str().to_owned(),
            message: error.to_string(),
        })?;

        Ok(Pattern {
            source,
            regex,
            captures,
            dynamic,
            literal_prefix,
        })
    }

    /// The pattern string this was compiled from, with its annotations.
    pub fn source(&self) -> &APath {
        &self.source
    }

    /// The capturing hole names, in order of appearance.
    pub fn captures(&self) -> &[String] {
        &self.captures
    }

    /// Whether the pattern contains at least one capturing hole.
    pub fn is_capturing(&self) -> bool {
        !self.captures.is_empty()
    }

    /// Whether the pattern contains a non-captured wildcard hole, making its
    /// concrete output set known only after execution.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Whether the pattern contains no holes at all and denotes a single
    /// concrete path.
    pub fn is_concrete(&self) -> bool {
        !self.dynamic && self.captures.is_empty()
    }

    /// The literal characters before the first hole. Used to root the
    /// filesystem traversal of [`Pattern::glob`] and as the tie-break when a
    /// path matches several of a step's output patterns.
    pub fn literal_prefix(&self) -> &str {
        &self.literal_prefix
    }

    /// Match a concrete path, returning the bindings for every capturing
    /// hole, or `None` when the path does not match.
    pub fn match_path(&self, path: &str) -> Option<Bindings> {
        let captures = self.regex.captures(path)?;
        let mut bindings = Bindings::new();
        for name in &self.captures {
            let value = captures.name(name).map(|m| m.as_str()).unwrap_or("");
            bindings.insert(name.clone(), value.to_owned());
        }
        Some(bindings)
    }

    /// Find the existing paths matching this pattern, in lexicographic
    /// order, each with the bindings captured from it. The returned paths
    /// carry the pattern's annotations.
    ///
    /// A concrete pattern is answered from the stat cache; a pattern with
    /// holes walks the filesystem below the pattern's literal prefix, so
    /// results always reflect the real directory tree.
    pub fn glob(&self, stat: &mut StatCache) -> Result<Vec<(APath, Bindings)>> {
        if self.is_concrete() {
            let path = self.literal_prefix.as_str();
            if stat.exists(path) {
                return Ok(vec![(
                    self.source.copy_annotations_to(path),
                    Bindings::new(),
                )]);
            }
            return Ok(Vec::new());
        }

        let (root, strip_dot) = match self.literal_prefix.rfind('/') {
            Some(0) => ("/".to_owned(), false),
            Some(index) => (self.literal_prefix[..index].to_owned(), false),
            None => (".".to_owned(), true),
        };

        let mut results: Vec<(APath, Bindings)> = Vec::new();
        for entry in WalkDir::new(&root).min_depth(1).into_iter().flatten() {
            let path = entry.path().to_string_lossy().into_owned();
            let path = if strip_dot {
                path.strip_prefix("./").map(str::to_owned).unwrap_or(path)
            } else {
                path
            };
            if let Some(bindings) = self.match_path(&path) {
                results.push((self.source.copy_annotations_to(path), bindings));
            }
        }
        results.sort_by(|left, right| left.0.as_str().cmp(right.0.as_str()));
        Ok(results)
    }

    /// Glob this pattern and collect the paths and bindings.
    pub fn glob_capture(&self, stat: &mut StatCache) -> Result<Captured> {
        let mut captured = Captured::default();
        for (path, bindings) in self.glob(stat)? {
            captured.paths.push(path);
            captured.bindings.push(bindings);
        }
        Ok(captured)
    }

    /// Glob this pattern and format `template` once per match, using the
    /// captured bindings.
    pub fn glob_fmt(&self, template: impl Into<APath>, stat: &mut StatCache) -> Result<Vec<APath>> {
        let template = template.into();
        let mut results = Vec::new();
        for (_, bindings) in self.glob(stat)? {
            results.push(format_pattern(&template, &bindings)?);
        }
        Ok(results)
    }
}

fn missing_binding(pattern: &str, name: &str) -> Error {
    Error::Pattern {
        pattern: pattern.to_owned(),
        message: format!("missing binding for: {name}"),
    }
}

/// Expand the interpolation holes of a template from a binding map,
/// preserving annotations.
///
/// Wildcard holes are not allowed here; use [`fmt_capture`] for patterns.
pub fn fmt(bindings: &Bindings, template: impl Into<APath>) -> Result<APath> {
    let template = template.into();
    let tokens = parse_tokens(template.as_str())?;
    let mut result = String::new();
    for token in &tokens {
        match token {
            Token::Literal(text) => result.push_str(text),
            Token::Interp(name) => match bindings.get(name) {
                Some(value) => result.push_str(value),
                None => return Err(missing_binding(template.as_str(), name)),
            },
            Token::Hole { name, .. } => {
                return Err(Error::Pattern {
                    pattern: template.as_str().to_owned(),
                    message: format!("wildcard hole in a plain template: {name}"),
                });
            }
        }
    }
    Ok(template.copy_annotations_to(result))
}

/// Expand the interpolation holes of a pattern, and also the captured holes
/// whose names are bound. Non-captured holes and unbound captured holes are
/// preserved, so the result is still a pattern.
///
/// This is how a step's output patterns are resolved against the step
/// instance's bindings: `obj/{*name}.o` with `name=a` becomes the concrete
/// `obj/a.o`, while `files/{*name}/{**_file}` with `name=x` becomes the
/// still-dynamic `files/x/{**_file}`.
pub fn fmt_capture(bindings: &Bindings, pattern: impl Into<APath>) -> Result<APath> {
    let pattern = pattern.into();
    let tokens = parse_tokens(pattern.as_str())?;
    let mut result: Vec<Token> = Vec::new();
    for token in tokens {
        match token {
            Token::Literal(_) => result.push(token),
            Token::Interp(ref name) => match bindings.get(name) {
                Some(value) => result.push(Token::Literal(value.clone())),
                None => return Err(missing_binding(pattern.as_str(), name)),
            },
            Token::Hole {
                ref name, captured, ..
            } => match bindings.get(name) {
                Some(value) if captured => result.push(Token::Literal(value.clone())),
                _ => result.push(token),
            },
        }
    }
    Ok(pattern.copy_annotations_to(serialize_tokens(&result)))
}

/// Format a pattern into a concrete path: every interpolation and capturing
/// hole must be bound, and non-captured holes are an error.
///
/// The universal invariant `match(p, format(p, b)) == b` holds for any
/// bindings consistent with the pattern.
pub fn format_pattern(pattern: impl Into<APath>, bindings: &Bindings) -> Result<APath> {
    let pattern = pattern.into();
    let tokens = parse_tokens(pattern.as_str())?;
    let mut result = String::new();
    for token in &tokens {
        match token {
            Token::Literal(text) => result.push_str(text),
            Token::Interp(name) => match bindings.get(name) {
                Some(value) => result.push_str(value),
                None => return Err(missing_binding(pattern.as_str(), name)),
            },
            Token::Hole { name, captured, .. } => {
                if !captured {
                    return Err(Error::Pattern {
                        pattern: pattern.as_str().to_owned(),
                        message: format!("cannot format the non-captured hole: {name}"),
                    });
                }
                match bindings.get(name) {
                    Some(value) => result.push_str(value),
                    None => return Err(missing_binding(pattern.as_str(), name)),
                }
            }
        }
    }
    Ok(pattern.copy_annotations_to(result))
}
