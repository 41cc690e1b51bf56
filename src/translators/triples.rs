//! N-Triples import and export
//!
//! Items are written as resources carrying their type-specific fields as
//! literals, creators in an ordered container and tags with their kind, so
//! that a library survives an export/import cycle unchanged.

use crate::core::error::{Result, TranslateError};
use crate::io::graph::{ContainerKind, GraphStore, Node};
use crate::pipeline::records::{ScrapedCreator, ScrapedTag};
use crate::translate::export::ExportItem;
use crate::translator::engine::TranslatorCode;
use crate::translator::sandbox::{ExportScope, ImportScope};
use crate::translator::types::Detection;
use std::sync::{Mutex, MutexGuard};

const NS: &str = "urn:biblio-translate:";
const ITEM_TYPE: &str = "bt:itemType";
const CREATORS: &str = "bt:creators";
const FIRST_NAME: &str = "bt:firstName";
const LAST_NAME: &str = "bt:lastName";
const CREATOR_TYPE: &str = "bt:creatorType";
const FIELD_MODE: &str = "bt:fieldMode";
const TAG: &str = "bt:tag";
const TAG_KIND: &str = "bt:tagKind";
const TAG_NAME: &str = "bt:tagName";
const NOTE: &str = "bt:note";
const FIELD_PREFIX: &str = "field:";

fn lock(graph: &Mutex<GraphStore>) -> MutexGuard<'_, GraphStore> {
    graph.lock().unwrap_or_else(|p| p.into_inner())
}

fn literal(graph: &GraphStore, subject: &Node, predicate: &str) -> Option<String> {
    graph
        .get_targets(subject, predicate)
        .into_iter()
        .find(Node::is_literal)
        .map(|node| node.value().to_string())
}

/// Everything read back for one item
struct ParsedItem {
    item_type: String,
    fields: Vec<(String, String)>,
    creators: Vec<ScrapedCreator>,
    tags: Vec<ScrapedTag>,
    notes: Vec<String>,
}

fn read_items(graph: &GraphStore) -> Vec<ParsedItem> {
    let field_ns = format!("{}{}", NS, FIELD_PREFIX);
    let mut items = Vec::new();

    for subject in graph.get_all_resources() {
        let Some(item_type) = literal(graph, &subject, ITEM_TYPE) else {
            continue;
        };

        let fields = graph
            .get_statements_matching(Some(&subject), None, None)
            .into_iter()
            .filter_map(|s| {
                let name = s.predicate.strip_prefix(&field_ns)?;
                s.object.is_literal().then(|| (name.to_string(), s.object.value().to_string()))
            })
            .collect();

        let creators = graph
            .get_targets(&subject, CREATORS)
            .first()
            .map(|container| graph.get_container_elements(container))
            .unwrap_or_default()
            .iter()
            .map(|node| ScrapedCreator {
                first_name: literal(graph, node, FIRST_NAME).unwrap_or_default(),
                last_name: literal(graph, node, LAST_NAME).unwrap_or_default(),
                creator_type: literal(graph, node, CREATOR_TYPE),
                field_mode: literal(graph, node, FIELD_MODE).and_then(|m| m.parse().ok()).unwrap_or(0),
            })
            .collect();

        let tags = graph
            .get_targets(&subject, TAG)
            .iter()
            .filter_map(|node| {
                let tag = literal(graph, node, TAG_NAME)?;
                Some(match literal(graph, node, TAG_KIND).and_then(|k| k.parse().ok()) {
                    Some(kind) => ScrapedTag::Typed { tag, kind },
                    None => ScrapedTag::Plain(tag),
                })
            })
            .collect();

        let notes = graph
            .get_targets(&subject, NOTE)
            .into_iter()
            .filter(Node::is_literal)
            .map(|node| node.value().to_string())
            .collect();

        items.push(ParsedItem {
            item_type,
            fields,
            creators,
            tags,
            notes,
        });
    }
    items
}

fn write_item(graph: &mut GraphStore, item: &ExportItem, export_notes: bool) -> Result<()> {
    let subject = graph.resource(&format!("bt:item/{}", item.item_id));
    graph.add_statement(&subject, ITEM_TYPE, Node::Literal(item.item_type.clone()))?;

    for (name, value) in &item.unique_fields {
        let predicate = format!("bt:{}{}", FIELD_PREFIX, name);
        graph.add_statement(&subject, &predicate, Node::Literal(value.clone()))?;
    }

    if !item.creators.is_empty() {
        let container = graph.new_container(ContainerKind::Seq, None)?;
        graph.add_statement(&subject, CREATORS, container.clone())?;
        for creator in &item.creators {
            let node = graph.new_resource();
            graph.add_statement(&node, LAST_NAME, Node::Literal(creator.last_name.clone()))?;
            if !creator.first_name.is_empty() {
                graph.add_statement(&node, FIRST_NAME, Node::Literal(creator.first_name.clone()))?;
            }
            if let Some(creator_type) = &creator.creator_type {
                graph.add_statement(&node, CREATOR_TYPE, Node::Literal(creator_type.clone()))?;
            }
            graph.add_statement(&node, FIELD_MODE, Node::Literal(creator.field_mode.to_string()))?;
            graph.add_container_element(&container, node)?;
        }
    }

    for tag in &item.tags {
        let node = graph.new_resource();
        graph.add_statement(&node, TAG_NAME, Node::Literal(tag.name().to_string()))?;
        if let ScrapedTag::Typed { kind, .. } = tag {
            graph.add_statement(&node, TAG_KIND, Node::Literal(kind.to_string()))?;
        }
        graph.add_statement(&subject, TAG, node)?;
    }

    if export_notes {
        for note in &item.notes {
            graph.add_statement(&subject, NOTE, Node::Literal(note.note.clone()))?;
        }
    }
    Ok(())
}

pub struct Triples;

impl TranslatorCode for Triples {
    fn detect_import(&self, scope: &ImportScope) -> Result<Detection> {
        let graph = scope.graph()?;
        let mut graph = lock(&graph);
        graph.add_namespace("bt", NS);
        let typed = graph.get_statements_matching(None, Some(ITEM_TYPE), None);
        Ok((!typed.is_empty()).into())
    }

    fn do_import(&self, scope: &ImportScope) -> Result<()> {
        let items = {
            let graph = scope.graph()?;
            let mut graph = lock(&graph);
            graph.add_namespace("bt", NS);
            read_items(&graph)
        };
        scope.debug(&format!("Read {} items from graph", items.len()));

        for parsed in items {
            let mut item = scope.new_item(&parsed.item_type);
            for (name, value) in parsed.fields {
                item.set_field(name, value);
            }
            item.creators = parsed.creators;
            item.tags = parsed.tags;
            item.notes = parsed.notes.iter().map(|n| n.as_str().into()).collect();
            item.complete()?;
        }
        Ok(())
    }

    fn do_export(&self, scope: &ExportScope) -> Result<()> {
        let export_notes = scope
            .get_option("exportNotes")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let graph = scope.graph()?;
        lock(&graph).add_namespace("bt", NS);

        while let Some(item) = scope.next_item()? {
            if item.item_type == "note" || item.item_type == "attachment" {
                continue;
            }
            let mut graph = lock(&graph);
            write_item(&mut graph, &item, export_notes)
                .map_err(|e| TranslateError::Execution(format!("item {}: {}", item.item_id, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::records::ScrapedCreator;
    use crate::translate::export::ExportNote;

    #[test]
    fn test_write_then_read_item() {
        let mut graph = GraphStore::new();
        graph.add_namespace("bt", NS);

        let mut item = ExportItem {
            item_id: 7,
            item_type: "book".to_string(),
            ..Default::default()
        };
        item.unique_fields.insert("title".to_string(), "Gödel, Escher, Bach".to_string());
        item.creators.push(ScrapedCreator::new("Douglas", "Hofstadter", Some("author")));
        item.creators.push(ScrapedCreator::new("", "Basic Books", Some("contributor")));
        item.tags.push(ScrapedTag::Typed {
            tag: "recursion".to_string(),
            kind: 1,
        });
        item.notes.push(ExportNote {
            item_id: 8,
            note: "Line one\nline \"two\"".to_string(),
        });
        write_item(&mut graph, &item, true).unwrap();

        // Survives N-Triples text as well
        let mut reparsed = GraphStore::new();
        reparsed.parse_ntriples(&graph.serialize()).unwrap();
        reparsed.add_namespace("bt", NS);

        let items = read_items(&reparsed);
        assert_eq!(items.len(), 1);
        let parsed = &items[0];
        assert_eq!(parsed.item_type, "book");
        assert_eq!(parsed.fields, vec![("title".to_string(), "Gödel, Escher, Bach".to_string())]);
        let names: Vec<&str> = parsed.creators.iter().map(|c| c.last_name.as_str()).collect();
        assert_eq!(names, vec!["Hofstadter", "Basic Books"]);
        assert_eq!(parsed.creators[0].first_name, "Douglas");
        assert_eq!(parsed.tags, vec![ScrapedTag::Typed { tag: "recursion".to_string(), kind: 1 }]);
        assert_eq!(parsed.notes, vec!["Line one\nline \"two\"".to_string()]);
    }
}
