//! In-memory statement graph for graph-mode translators
//!
//! Stores subject/predicate/object statements with namespace expansion,
//! RDF containers and an N-Triples reader/writer.

use crate::core::error::{Result, TranslateError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

pub const RDF_NS: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";

/// Shared graph handed to translator code
pub type GraphHandle = Arc<Mutex<GraphStore>>;

/// A graph node
///
/// Serialized as `{"kind": "resource", "value": "<uri>"}` for script code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Node {
    /// Named resource (absolute URI)
    Resource(String),
    /// Blank node label, without the `_:` prefix
    Blank(String),
    Literal(String),
}

impl Node {
    pub fn is_literal(&self) -> bool {
        matches!(self, Node::Literal(_))
    }

    /// URI, blank label or literal value
    pub fn value(&self) -> &str {
        match self {
            Node::Resource(v) | Node::Blank(v) | Node::Literal(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Statement {
    pub subject: Node,
    pub predicate: String,
    pub object: Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Seq,
    Bag,
    Alt,
}

impl ContainerKind {
    fn type_uri(&self) -> String {
        let name = match self {
            ContainerKind::Seq => "Seq",
            ContainerKind::Bag => "Bag",
            ContainerKind::Alt => "Alt",
        };
        format!("{}{}", RDF_NS, name)
    }
}

/// Statement store with insertion-ordered enumeration
#[derive(Debug, Clone)]
pub struct GraphStore {
    statements: Vec<Statement>,
    index: HashSet<Statement>,
    namespaces: BTreeMap<String, String>,
    blank_labels: HashSet<String>,
    next_blank: usize,
}

impl Default for GraphStore {
    fn default() -> Self {
        let mut namespaces = BTreeMap::new();
        namespaces.insert("rdf".to_string(), RDF_NS.to_string());
        Self {
            statements: Vec::new(),
            index: HashSet::new(),
            namespaces,
            blank_labels: HashSet::new(),
            next_blank: 0,
        }
    }
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_handle(self) -> GraphHandle {
        Arc::new(Mutex::new(self))
    }

    pub fn add_namespace(&mut self, prefix: &str, uri: &str) {
        self.namespaces.insert(prefix.to_string(), uri.to_string());
    }

    /// Expand a `prefix:local` name when the prefix is registered
    pub fn expand(&self, name: &str) -> String {
        if let Some((prefix, local)) = name.split_once(':') {
            if let Some(uri) = self.namespaces.get(prefix) {
                return format!("{}{}", uri, local);
            }
        }
        name.to_string()
    }

    /// Named resource node, expanding any registered prefix
    pub fn resource(&self, uri: &str) -> Node {
        Node::Resource(self.expand(uri))
    }

    /// Fresh blank node
    pub fn new_resource(&mut self) -> Node {
        loop {
            let label = format!("b{}", self.next_blank);
            self.next_blank += 1;
            if self.blank_labels.insert(label.clone()) {
                return Node::Blank(label);
            }
        }
    }

    /// Add a statement; returns false when it was already present
    pub fn add_statement(&mut self, subject: &Node, predicate: &str, object: Node) -> Result<bool> {
        if subject.is_literal() {
            return Err(TranslateError::Validation(format!(
                "literal cannot be a statement subject: {}",
                subject.value()
            )));
        }
        let statement = Statement {
            subject: subject.clone(),
            predicate: self.expand(predicate),
            object,
        };
        if self.index.contains(&statement) {
            return Ok(false);
        }
        for node in [&statement.subject, &statement.object] {
            if let Node::Blank(label) = node {
                self.blank_labels.insert(label.clone());
            }
        }
        self.index.insert(statement.clone());
        self.statements.push(statement);
        Ok(true)
    }

    /// Remove matching statements, returning how many were removed
    pub fn remove_statements(
        &mut self,
        subject: Option<&Node>,
        predicate: Option<&str>,
        object: Option<&Node>,
    ) -> usize {
        let predicate = predicate.map(|p| self.expand(p));
        let before = self.statements.len();
        let index = &mut self.index;
        self.statements.retain(|s| {
            let matched = statement_matches(s, subject, predicate.as_deref(), object);
            if matched {
                index.remove(s);
            }
            !matched
        });
        before - self.statements.len()
    }

    /// Create a container node typed as Seq, Bag or Alt
    pub fn new_container(&mut self, kind: ContainerKind, about: Option<Node>) -> Result<Node> {
        let node = match about {
            Some(node) => node,
            None => self.new_resource(),
        };
        self.add_statement(&node, &format!("{}type", RDF_NS), Node::Resource(kind.type_uri()))?;
        Ok(node)
    }

    /// Append an element under the next free `rdf:_n` arc
    pub fn add_container_element(&mut self, container: &Node, element: Node) -> Result<()> {
        let next = self
            .container_members(container)
            .last()
            .map(|(n, _)| n + 1)
            .unwrap_or(1);
        self.add_statement(container, &format!("{}_{}", RDF_NS, next), element)?;
        Ok(())
    }

    /// Container elements in membership order
    pub fn get_container_elements(&self, container: &Node) -> Vec<Node> {
        self.container_members(container).into_iter().map(|(_, node)| node).collect()
    }

    fn container_members(&self, container: &Node) -> Vec<(usize, Node)> {
        let prefix = format!("{}_", RDF_NS);
        let mut members: Vec<(usize, Node)> = self
            .statements
            .iter()
            .filter(|s| &s.subject == container)
            .filter_map(|s| {
                let n = s.predicate.strip_prefix(&prefix)?.parse::<usize>().ok()?;
                Some((n, s.object.clone()))
            })
            .collect();
        members.sort_by_key(|(n, _)| *n);
        members
    }

    /// Objects of `subject predicate ?`
    pub fn get_targets(&self, subject: &Node, predicate: &str) -> Vec<Node> {
        let predicate = self.expand(predicate);
        self.statements
            .iter()
            .filter(|s| &s.subject == subject && s.predicate == predicate)
            .map(|s| s.object.clone())
            .collect()
    }

    /// Subjects of `? predicate object`
    pub fn get_sources(&self, predicate: &str, object: &Node) -> Vec<Node> {
        let predicate = self.expand(predicate);
        self.statements
            .iter()
            .filter(|s| &s.object == object && s.predicate == predicate)
            .map(|s| s.subject.clone())
            .collect()
    }

    /// Distinct predicates leaving `subject`
    pub fn get_arcs_out(&self, subject: &Node) -> Vec<String> {
        let mut seen = HashSet::new();
        self.statements
            .iter()
            .filter(|s| &s.subject == subject)
            .filter(|s| seen.insert(s.predicate.clone()))
            .map(|s| s.predicate.clone())
            .collect()
    }

    /// Distinct subjects in first-seen order
    pub fn get_all_resources(&self) -> Vec<Node> {
        let mut seen = HashSet::new();
        self.statements
            .iter()
            .filter(|s| seen.insert(s.subject.clone()))
            .map(|s| s.subject.clone())
            .collect()
    }

    pub fn get_statements_matching(
        &self,
        subject: Option<&Node>,
        predicate: Option<&str>,
        object: Option<&Node>,
    ) -> Vec<Statement> {
        let predicate = predicate.map(|p| self.expand(p));
        self.statements
            .iter()
            .filter(|s| statement_matches(s, subject, predicate.as_deref(), object))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Serialize as N-Triples, one statement per line in insertion order
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for s in &self.statements {
            write_node(&mut out, &s.subject);
            let _ = write!(out, " <{}> ", s.predicate);
            write_node(&mut out, &s.object);
            out.push_str(" .\n");
        }
        out
    }

    /// Parse N-Triples text into this store.
    ///
    /// Language tags and datatypes on literals are accepted and dropped.
    pub fn parse_ntriples(&mut self, text: &str) -> Result<usize> {
        let mut added = 0;
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parser = LineParser { rest: line, line: number + 1 };
            let subject = parser.node()?;
            let predicate = match parser.node()? {
                Node::Resource(uri) => uri,
                other => return Err(parser.error(&format!("predicate must be a URI, got {:?}", other))),
            };
            let object = parser.node()?;
            parser.end()?;
            if self.add_statement(&subject, &predicate, object)? {
                added += 1;
            }
        }
        Ok(added)
    }
}

fn statement_matches(
    s: &Statement,
    subject: Option<&Node>,
    predicate: Option<&str>,
    object: Option<&Node>,
) -> bool {
    subject.map_or(true, |n| &s.subject == n)
        && predicate.map_or(true, |p| s.predicate == p)
        && object.map_or(true, |n| &s.object == n)
}

fn write_node(out: &mut String, node: &Node) {
    match node {
        Node::Resource(uri) => {
            let _ = write!(out, "<{}>", uri);
        }
        Node::Blank(label) => {
            let _ = write!(out, "_:{}", label);
        }
        Node::Literal(value) => {
            out.push('"');
            for c in value.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '"' => out.push_str("\\\""),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    c => out.push(c),
                }
            }
            out.push('"');
        }
    }
}

struct LineParser<'a> {
    rest: &'a str,
    line: usize,
}

impl<'a> LineParser<'a> {
    fn error(&self, message: &str) -> TranslateError {
        TranslateError::Validation(format!("N-Triples line {}: {}", self.line, message))
    }

    fn node(&mut self) -> Result<Node> {
        self.rest = self.rest.trim_start();
        if let Some(rest) = self.rest.strip_prefix('<') {
            let end = rest.find('>').ok_or_else(|| self.error("unterminated URI"))?;
            self.rest = &rest[end + 1..];
            return Ok(Node::Resource(rest[..end].to_string()));
        }
        if let Some(rest) = self.rest.strip_prefix("_:") {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            let label = rest[..end].trim_end_matches('.');
            if label.is_empty() {
                return Err(self.error("empty blank node label"));
            }
            self.rest = &rest[label.len()..];
            return Ok(Node::Blank(label.to_string()));
        }
        if let Some(rest) = self.rest.strip_prefix('"') {
            return self.literal(rest);
        }
        Err(self.error("expected a node"))
    }

    fn literal(&mut self, body: &'a str) -> Result<Node> {
        let mut value = String::new();
        let mut chars = body.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.rest = &body[i + 1..];
                    self.skip_literal_suffix()?;
                    return Ok(Node::Literal(value));
                }
                '\\' => {
                    let (_, escaped) = chars.next().ok_or_else(|| self.error("dangling escape"))?;
                    match escaped {
                        'n' => value.push('\n'),
                        'r' => value.push('\r'),
                        't' => value.push('\t'),
                        '"' => value.push('"'),
                        '\\' => value.push('\\'),
                        'u' | 'U' => {
                            let width = if escaped == 'u' { 4 } else { 8 };
                            let hex: String = chars.by_ref().take(width).map(|(_, h)| h).collect();
                            let code = u32::from_str_radix(&hex, 16)
                                .ok()
                                .filter(|_| hex.len() == width)
                                .and_then(char::from_u32)
                                .ok_or_else(|| self.error("bad unicode escape"))?;
                            value.push(code);
                        }
                        other => return Err(self.error(&format!("unknown escape \\{}", other))),
                    }
                }
                c => value.push(c),
            }
        }
        Err(self.error("unterminated literal"))
    }

    fn skip_literal_suffix(&mut self) -> Result<()> {
        if let Some(rest) = self.rest.strip_prefix('@') {
            let end = rest.find(|c: char| !(c.is_ascii_alphanumeric() || c == '-')).unwrap_or(rest.len());
            self.rest = &rest[end..];
        } else if let Some(rest) = self.rest.strip_prefix("^^<") {
            let end = rest.find('>').ok_or_else(|| self.error("unterminated datatype"))?;
            self.rest = &rest[end + 1..];
        }
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let rest = self.rest.trim();
        let rest = rest.strip_prefix('.').ok_or_else(|| self.error("expected '.'"))?;
        let rest = rest.trim_start();
        if rest.is_empty() || rest.starts_with('#') {
            Ok(())
        } else {
            Err(self.error("trailing content after '.'"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DC: &str = "http://purl.org/dc/elements/1.1/";

    #[test]
    fn test_statements_deduplicate() {
        let mut graph = GraphStore::new();
        graph.add_namespace("dc", DC);
        let item = graph.resource("urn:isbn:9780262033848");

        assert!(graph.add_statement(&item, "dc:title", Node::Literal("Algorithms".into())).unwrap());
        assert!(!graph.add_statement(&item, "dc:title", Node::Literal("Algorithms".into())).unwrap());
        assert_eq!(graph.len(), 1);
        assert_eq!(
            graph.get_targets(&item, &format!("{}title", DC)),
            vec![Node::Literal("Algorithms".into())]
        );
    }

    #[test]
    fn test_literal_subject_rejected() {
        let mut graph = GraphStore::new();
        let literal = Node::Literal("x".into());
        assert!(graph.add_statement(&literal, "rdf:value", Node::Literal("y".into())).is_err());
    }

    #[test]
    fn test_containers_keep_order() {
        let mut graph = GraphStore::new();
        let seq = graph.new_container(ContainerKind::Seq, None).unwrap();
        for name in ["first", "second", "third"] {
            graph.add_container_element(&seq, Node::Literal(name.into())).unwrap();
        }

        let elements: Vec<String> = graph
            .get_container_elements(&seq)
            .iter()
            .map(|n| n.value().to_string())
            .collect();
        assert_eq!(elements, vec!["first", "second", "third"]);
        assert_eq!(
            graph.get_sources("rdf:type", &Node::Resource(format!("{}Seq", RDF_NS))),
            vec![seq]
        );
    }

    #[test]
    fn test_ntriples_round_trip() {
        let mut graph = GraphStore::new();
        let item = Node::Resource("http://example.org/item/1".into());
        let creator = graph.new_resource();
        graph
            .add_statement(&item, "http://purl.org/dc/terms/title", Node::Literal("Say \"hi\"\nthere".into()))
            .unwrap();
        graph.add_statement(&item, "http://purl.org/dc/terms/creator", creator.clone()).unwrap();
        graph
            .add_statement(&creator, "http://xmlns.com/foaf/0.1/surname", Node::Literal("Ng".into()))
            .unwrap();

        let text = graph.serialize();
        let mut parsed = GraphStore::new();
        assert_eq!(parsed.parse_ntriples(&text).unwrap(), 3);
        assert_eq!(parsed.serialize(), text);
    }

    #[test]
    fn test_parse_ignores_comments_and_tags() {
        let text = "# comment\n<http://a> <http://p> \"v\"@en .\n<http://a> <http://q> \"1\"^^<http://www.w3.org/2001/XMLSchema#int> .\n_:x <http://p> \"\\u00e9\" .\n";
        let mut graph = GraphStore::new();
        assert_eq!(graph.parse_ntriples(text).unwrap(), 3);
        assert_eq!(graph.get_arcs_out(&Node::Resource("http://a".into())), vec!["http://p", "http://q"]);
        assert_eq!(
            graph.get_targets(&Node::Blank("x".into()), "http://p"),
            vec![Node::Literal("é".into())]
        );

        // Parsed blank labels are never reused
        let fresh = graph.new_resource();
        assert_ne!(fresh, Node::Blank("x".into()));
    }

    #[test]
    fn test_parse_errors_name_line() {
        let mut graph = GraphStore::new();
        let err = graph.parse_ntriples("<http://a> <http://p> \"open .\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_remove_statements() {
        let mut graph = GraphStore::new();
        let a = Node::Resource("http://a".into());
        graph.add_statement(&a, "http://p", Node::Literal("1".into())).unwrap();
        graph.add_statement(&a, "http://p", Node::Literal("2".into())).unwrap();
        graph.add_statement(&a, "http://q", Node::Literal("3".into())).unwrap();

        assert_eq!(graph.remove_statements(Some(&a), Some("http://p"), None), 2);
        assert_eq!(graph.get_all_resources(), vec![a.clone()]);
        assert_eq!(graph.get_statements_matching(None, None, None).len(), 1);
        assert!(graph.add_statement(&a, "http://p", Node::Literal("1".into())).unwrap());
    }
}
