//! Item saver
//!
//! Folds scraped records into the library: creators are deduplicated, fields
//! are mapped onto the item type's canonical names, tags are bucketed by kind
//! and translator-local ids are tracked so `see_also` links and collection
//! members resolve after the primary save.

use crate::core::config::PrefsConfig;
use crate::core::error::{Result, TranslateError};
use crate::library::models::{
    CollectionId, CreatorId, CreatorName, ItemCreator, ItemId, TAG_KIND_AUTOMATIC, TAG_KIND_USER,
};
use crate::library::schema::{self, ItemTypeSchema, FALLBACK_CREATOR_TYPE};
use crate::library::store::LibraryStore;
use crate::pipeline::attachments::{self, AttachmentFetcher};
use crate::pipeline::records::{CollectionChild, ScrapedCollection, ScrapedItem, ScrapedTag};
use crate::translator::types::Mode;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Placeholder some translators put in `accessDate`
const CURRENT_TIMESTAMP: &str = "CURRENT_TIMESTAMP";

/// Materializes scraped records for one operation
pub struct ItemSaver {
    store: Arc<dyn LibraryStore>,
    fetcher: Arc<dyn AttachmentFetcher>,
    prefs: PrefsConfig,
    mode: Mode,
    base_dir: Option<PathBuf>,
    default_item_type: Option<String>,
    id_map: HashMap<String, ItemId>,
    creator_cache: HashMap<CreatorName, CreatorId>,
    pending_see_also: Vec<(ItemId, Vec<String>)>,
    saved: Vec<ItemId>,
}

impl ItemSaver {
    pub fn new(
        store: Arc<dyn LibraryStore>,
        fetcher: Arc<dyn AttachmentFetcher>,
        prefs: PrefsConfig,
        mode: Mode,
    ) -> Self {
        Self {
            store,
            fetcher,
            prefs,
            mode,
            base_dir: None,
            default_item_type: None,
            id_map: HashMap::new(),
            creator_cache: HashMap::new(),
            pending_see_also: Vec::new(),
            saved: Vec::new(),
        }
    }

    /// Directory relative attachment paths are resolved against
    pub fn set_base_dir(&mut self, dir: Option<PathBuf>) {
        self.base_dir = dir;
    }

    /// Item type for records that do not name one
    pub fn set_default_item_type(&mut self, item_type: Option<String>) {
        self.default_item_type = item_type;
    }

    /// Translator-local id to persisted id
    pub fn id_map(&self) -> &HashMap<String, ItemId> {
        &self.id_map
    }

    /// Top-level items saved so far, in save order
    pub fn saved_items(&self) -> &[ItemId] {
        &self.saved
    }

    fn importing(&self) -> bool {
        self.mode == Mode::Import
    }

    /// Persist one record. Returns `None` when the record was discarded.
    pub fn materialize(&mut self, record: ScrapedItem, parent: Option<ItemId>) -> Result<Option<ItemId>> {
        let id = if record.is_note() {
            self.save_note(&record, parent)?
        } else if record.is_attachment() {
            match self.save_standalone_attachment(&record, parent)? {
                Some(id) => id,
                None => return Ok(None),
            }
        } else {
            self.save_regular_item(&record, parent)?
        };

        if let Some(local) = record.item_id.as_ref() {
            if self.id_map.insert(local.clone(), id).is_some() {
                warn!(item_id = %local, "Duplicate itemID; later record wins");
            }
        }
        if !record.see_also.is_empty() {
            self.pending_see_also.push((id, record.see_also.clone()));
        }
        if parent.is_none() {
            self.saved.push(id);
        }
        Ok(Some(id))
    }

    fn save_note(&mut self, record: &ScrapedItem, parent: Option<ItemId>) -> Result<ItemId> {
        let body = record
            .note
            .as_deref()
            .or_else(|| record.field("note"))
            .unwrap_or_default();
        let id = self.store.create_note(body, parent)?;
        self.save_tags(id, &record.tags)?;
        debug!(item = id, "Saved note");
        Ok(id)
    }

    fn save_standalone_attachment(&mut self, record: &ScrapedItem, parent: Option<ItemId>) -> Result<Option<ItemId>> {
        if !self.importing() {
            info!(mode = %self.mode, "Discarding standalone attachment outside import");
            return Ok(None);
        }
        let attachment = record.as_attachment();
        let action = attachments::plan_standalone(&attachment, self.base_dir.as_deref());
        match attachments::acquire(action, &attachment, parent, self.fetcher.as_ref()) {
            Some(new) => Ok(Some(self.store.create_attachment(new)?)),
            None => Ok(None),
        }
    }

    fn save_regular_item(&mut self, record: &ScrapedItem, parent: Option<ItemId>) -> Result<ItemId> {
        let type_name = record
            .item_type
            .clone()
            .or_else(|| self.default_item_type.clone())
            .ok_or_else(|| TranslateError::Validation("item has no itemType".to_string()))?;
        let schema = schema::item_type(&type_name)
            .ok_or_else(|| TranslateError::Validation(format!("unknown item type: {}", type_name)))?;

        if self.mode == Mode::Web && record.field("title").map_or(true, |t| t.trim().is_empty()) {
            return Err(TranslateError::Validation("item has no title".to_string()));
        }

        let fields = map_fields(schema, &record.fields);
        let id = self.store.create_item(schema.name, fields)?;
        if parent.is_some() {
            debug!(item = id, parent = ?parent, "Regular items cannot have parents; saved top-level");
        }

        self.save_creators(id, schema, record)?;
        self.save_tags(id, &record.tags)?;

        for note in &record.notes {
            self.store.create_note(&note.note, Some(id))?;
        }

        for attachment in &record.attachments {
            let action = attachments::plan_nested(attachment, self.importing(), &self.prefs, self.base_dir.as_deref());
            if let Some(new) = attachments::acquire(action, attachment, Some(id), self.fetcher.as_ref()) {
                self.store.create_attachment(new)?;
            }
        }

        debug!(item = id, item_type = schema.name, "Saved item");
        Ok(id)
    }

    fn save_creators(&mut self, item: ItemId, schema: &ItemTypeSchema, record: &ScrapedItem) -> Result<()> {
        let mut creators = Vec::with_capacity(record.creators.len());
        for creator in &record.creators {
            let name = CreatorName::new(&creator.first_name, &creator.last_name, creator.field_mode);
            if name.first_name.is_empty() && name.last_name.is_empty() {
                warn!(item, "Discarding creator with an empty name");
                continue;
            }

            let creator_id = match self.creator_cache.get(&name) {
                Some(id) => *id,
                None => {
                    let id = match self.store.find_creator(&name)? {
                        Some(id) => id,
                        None => self.store.create_creator(&name)?,
                    };
                    self.creator_cache.insert(name, id);
                    id
                }
            };

            let role = match schema.creator_type(creator.creator_type.as_deref()) {
                Some(role) => role,
                None => {
                    warn!(
                        item_type = schema.name,
                        creator_type = ?creator.creator_type,
                        "Invalid creator type, using {}",
                        FALLBACK_CREATOR_TYPE
                    );
                    FALLBACK_CREATOR_TYPE
                }
            };

            creators.push(ItemCreator {
                creator_id,
                creator_type: role.to_string(),
                order: creators.len(),
            });
        }

        if !creators.is_empty() {
            self.store.set_creators(item, creators)?;
        }
        Ok(())
    }

    /// One `add_tags` call per kind
    fn save_tags(&mut self, item: ItemId, tags: &[ScrapedTag]) -> Result<()> {
        let plain_kind = if self.importing() { TAG_KIND_USER } else { TAG_KIND_AUTOMATIC };
        let mut buckets: BTreeMap<u8, Vec<String>> = BTreeMap::new();
        for tag in tags {
            let name = tag.name().trim();
            if name.is_empty() {
                warn!(item, "Discarding empty tag");
                continue;
            }
            let kind = match tag {
                ScrapedTag::Plain(_) => plain_kind,
                ScrapedTag::Typed { kind, .. } => *kind,
            };
            buckets.entry(kind).or_default().push(name.to_string());
        }
        for (kind, names) in buckets {
            self.store.add_tags(item, kind, &names)?;
        }
        Ok(())
    }

    /// Persist a collection tree, depth first
    pub fn save_collection(
        &mut self,
        collection: &ScrapedCollection,
        parent: Option<CollectionId>,
    ) -> Result<CollectionId> {
        let id = self.store.create_collection(&collection.name, parent)?;
        let mut members = Vec::new();
        for child in &collection.children {
            match child {
                CollectionChild::Item { id: local } => match self.id_map.get(local) {
                    Some(item) => members.push(*item),
                    None => warn!(collection = %collection.name, item_id = %local, "Collection member was never saved"),
                },
                CollectionChild::Collection(sub) => {
                    self.save_collection(sub, Some(id))?;
                }
            }
        }
        if !members.is_empty() {
            self.store.add_to_collection(id, &members)?;
        }
        debug!(collection = id, name = %collection.name, members = members.len(), "Saved collection");
        Ok(id)
    }

    /// Second pass: resolve `see_also` references through the id map
    pub fn finish(&mut self) -> Result<()> {
        for (item, references) in std::mem::take(&mut self.pending_see_also) {
            for reference in references {
                match self.id_map.get(&reference) {
                    Some(related) if *related != item => self.store.add_related(item, *related)?,
                    Some(_) => {}
                    None => warn!(item, reference = %reference, "Unresolved seeAlso reference"),
                }
            }
        }
        Ok(())
    }
}

fn map_fields(schema: &ItemTypeSchema, raw: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    for (name, value) in raw {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match schema.canonical_field(name) {
            Some(canonical) => {
                let value = if canonical == "accessDate" && value == CURRENT_TIMESTAMP {
                    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
                } else {
                    value.to_string()
                };
                fields.insert(canonical.to_string(), value);
            }
            None => warn!(item_type = schema.name, field = %name, "Discarding field not valid for item type"),
        }
    }

    if schema.has_field("shortTitle") && !fields.contains_key("shortTitle") {
        if let Some(short) = fields.get("title").and_then(|title| short_title(title)) {
            fields.insert("shortTitle".to_string(), short);
        }
    }
    fields
}

/// Short title derived from a full title.
///
/// Cuts before the first colon, or else keeps everything through the first
/// question mark. `None` when neither applies or nothing would be cut.
pub fn short_title(title: &str) -> Option<String> {
    let short = if let Some(colon) = title.find(':') {
        title[..colon].trim_end()
    } else if let Some(question) = title.find('?') {
        &title[..=question]
    } else {
        return None;
    };
    let short = short.trim();
    if short.is_empty() || short == title.trim() {
        None
    } else {
        Some(short.to_string())
    }
}
