//! Configuration graph: presentation configurations, their transitions and
//! tracks, the remote items they reference, and the groups the lobby cycles
//! through.
//!
//! Items are shared by stable ID rather than owned by configurations. A
//! configuration is keyed by the ID of the remote item holding its document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::core::models::{ItemId, RemoteItem};

/// Longest transition the player accepts
pub const MAX_TRANSITION_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    None,
    Fade,
    Slide,
    Dissolve,
    Push,
    Reveal,
}

impl TransitionKind {
    /// Kinds that move content across the screen and so need a direction
    pub fn is_directional(&self) -> bool {
        matches!(
            self,
            TransitionKind::Slide | TransitionKind::Push | TransitionKind::Reveal
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransitionDirection {
    Left,
    Right,
    Up,
    Down,
}

/// Transition between two slides. Replaced wholesale, never edited in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlideTransition {
    kind: TransitionKind,

    #[serde(default)]
    duration_ms: u64,

    #[serde(default)]
    direction: Option<TransitionDirection>,
}

impl SlideTransition {
    pub fn new(
        kind: TransitionKind,
        duration_ms: u64,
        direction: Option<TransitionDirection>,
    ) -> Self {
        Self {
            kind,
            duration_ms,
            direction,
        }
    }

    pub fn kind(&self) -> TransitionKind {
        self.kind
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn direction(&self) -> Option<TransitionDirection> {
        self.direction
    }

    /// Describe what is wrong with the transition, if anything
    pub fn check(&self) -> Result<(), String> {
        if self.kind != TransitionKind::None
            && (self.duration_ms == 0 || self.duration_ms > MAX_TRANSITION_MS)
        {
            return Err(format!(
                "{:?} duration must be within 1..={} ms, got {}",
                self.kind, MAX_TRANSITION_MS, self.duration_ms
            ));
        }

        match (self.kind.is_directional(), self.direction) {
            (true, None) => Err(format!("{:?} transition requires a direction", self.kind)),
            (false, Some(direction)) => Err(format!(
                "{:?} transition does not take a direction ({:?})",
                self.kind, direction
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackStep {
    pub item_id: ItemId,
    pub duration_ms: u64,
}

/// Ordered playback track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackConfiguration {
    #[serde(default)]
    pub steps: Vec<TrackStep>,

    #[serde(default = "default_true")]
    pub looping: bool,
}

fn default_true() -> bool {
    true
}

/// Wire shape of a configuration document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConfigurationDocument {
    #[serde(default)]
    pub transition: Option<SlideTransition>,

    #[serde(default)]
    pub track: Option<TrackConfiguration>,

    /// Associated media item
    #[serde(default)]
    pub media: Option<ItemId>,

    #[serde(default = "default_true")]
    pub active: bool,
}

impl ConfigurationDocument {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// How one group is presented
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresentationConfiguration {
    /// ID of the remote item carrying this configuration's document
    pub id: ItemId,

    pub transition: Option<SlideTransition>,

    pub track: Option<TrackConfiguration>,

    pub media: Option<ItemId>,

    pub active: bool,

    /// Result of the last validation, refreshed on every commit
    pub valid_for_display: bool,

    pub updated_at: DateTime<Utc>,
}

impl PresentationConfiguration {
    pub fn from_document(id: impl Into<ItemId>, document: ConfigurationDocument) -> Self {
        Self {
            id: id.into(),
            transition: document.transition,
            track: document.track,
            media: document.media,
            active: document.active,
            valid_for_display: false,
            updated_at: Utc::now(),
        }
    }

    /// Items the configuration needs on disk, its own document excluded
    pub fn referenced_items(&self) -> BTreeSet<ItemId> {
        let mut items = BTreeSet::new();
        if let Some(media) = &self.media {
            items.insert(media.clone());
        }
        if let Some(track) = &self.track {
            items.extend(track.steps.iter().map(|step| step.item_id.clone()));
        }
        items
    }

    pub fn references(&self, item_id: &str) -> bool {
        self.id == item_id
            || self.media.as_deref() == Some(item_id)
            || self
                .track
                .as_ref()
                .map(|track| track.steps.iter().any(|step| step.item_id == item_id))
                .unwrap_or(false)
    }
}

/// Named group of configurations shown in the lobby rotation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresentationGroup {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub configuration_ids: Vec<ItemId>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl PresentationGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: None,
            configuration_ids: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_configuration(mut self, configuration_id: impl Into<ItemId>) -> Self {
        self.configuration_ids.push(configuration_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum InvalidReason {
    /// Referenced item has no record in the graph
    MissingItem(ItemId),
    /// Referenced item exists but nothing is cached for it
    NotCached(ItemId),
    MalformedTransition(String),
    EmptyTrack,
    ZeroStepDuration(ItemId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub config_id: ItemId,
    pub valid: bool,
    pub reasons: Vec<InvalidReason>,
}

/// One mutation recorded by a store transaction
#[derive(Debug, Clone, PartialEq)]
pub enum GraphWrite {
    RemoteItem(RemoteItem),
    RemoveRemoteItem(ItemId),
    Configuration(PresentationConfiguration),
    /// Also drops the configuration from every group
    RemoveConfiguration(ItemId),
    Group(PresentationGroup),
    RemoveGroup(String),
    MarkGcCandidate(ItemId),
    ClearGcCandidate(ItemId),
}

/// What a reachability sweep would remove
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepPlan {
    pub configurations: Vec<ItemId>,
    pub items: Vec<RemoteItem>,
}

impl SweepPlan {
    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty() && self.items.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigurationGraph {
    #[serde(default)]
    revision: u64,

    #[serde(default)]
    items: BTreeMap<ItemId, RemoteItem>,

    #[serde(default)]
    configurations: BTreeMap<ItemId, PresentationConfiguration>,

    /// Rotation order is the vector order
    #[serde(default)]
    groups: Vec<PresentationGroup>,

    #[serde(default)]
    gc_candidates: BTreeSet<ItemId>,
}

impl ConfigurationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped by every commit
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn item(&self, id: &str) -> Option<&RemoteItem> {
        self.items.get(id)
    }

    pub fn items(&self) -> impl Iterator<Item = &RemoteItem> {
        self.items.values()
    }

    pub fn configuration(&self, id: &str) -> Option<&PresentationConfiguration> {
        self.configurations.get(id)
    }

    pub fn configurations(&self) -> impl Iterator<Item = &PresentationConfiguration> {
        self.configurations.values()
    }

    pub fn group(&self, id: &str) -> Option<&PresentationGroup> {
        self.groups.iter().find(|group| group.id == id)
    }

    pub fn groups(&self) -> &[PresentationGroup] {
        &self.groups
    }

    pub fn gc_candidates(&self) -> &BTreeSet<ItemId> {
        &self.gc_candidates
    }

    pub fn is_gc_candidate(&self, id: &str) -> bool {
        self.gc_candidates.contains(id)
    }

    pub fn apply(&mut self, write: GraphWrite) {
        match write {
            GraphWrite::RemoteItem(item) => {
                self.items.insert(item.id.clone(), item);
            }
            GraphWrite::RemoveRemoteItem(id) => {
                self.items.remove(&id);
                self.gc_candidates.remove(&id);
            }
            GraphWrite::Configuration(config) => {
                self.configurations.insert(config.id.clone(), config);
            }
            GraphWrite::RemoveConfiguration(id) => {
                self.configurations.remove(&id);
                for group in &mut self.groups {
                    group.configuration_ids.retain(|config_id| config_id != &id);
                }
            }
            GraphWrite::Group(group) => {
                match self.groups.iter_mut().find(|existing| existing.id == group.id) {
                    Some(existing) => *existing = group,
                    None => self.groups.push(group),
                }
            }
            GraphWrite::RemoveGroup(id) => {
                self.groups.retain(|group| group.id != id);
            }
            GraphWrite::MarkGcCandidate(id) => {
                self.gc_candidates.insert(id);
            }
            GraphWrite::ClearGcCandidate(id) => {
                self.gc_candidates.remove(&id);
            }
        }
    }

    /// Apply a committed batch, refresh display validity, bump the revision.
    /// Stores call this on their private copy and publish the result whole.
    pub fn commit_writes(&mut self, writes: &[GraphWrite]) -> u64 {
        for write in writes {
            self.apply(write.clone());
        }
        self.refresh_validity();
        self.revision += 1;
        self.revision
    }

    /// Recompute `valid_for_display` for every configuration
    pub fn refresh_validity(&mut self) {
        let verdicts: Vec<(ItemId, bool)> = self
            .configurations
            .values()
            .map(|config| (config.id.clone(), self.validate(config).valid))
            .collect();

        for (id, valid) in verdicts {
            if let Some(config) = self.configurations.get_mut(&id) {
                config.valid_for_display = valid;
            }
        }
    }

    fn check_cached(&self, item_id: &str, reasons: &mut Vec<InvalidReason>) {
        match self.items.get(item_id) {
            None => reasons.push(InvalidReason::MissingItem(item_id.to_string())),
            Some(item) if !item.is_cached() => {
                reasons.push(InvalidReason::NotCached(item_id.to_string()))
            }
            Some(_) => {}
        }
    }

    /// Check whether `config` may be shown with what is on disk now.
    ///
    /// A referenced item that has an older version cached still counts: the
    /// lobby keeps showing the last good copy while a newer one downloads.
    pub fn validate(&self, config: &PresentationConfiguration) -> ValidationReport {
        let mut reasons = Vec::new();

        self.check_cached(&config.id, &mut reasons);

        if let Some(transition) = &config.transition {
            if let Err(problem) = transition.check() {
                reasons.push(InvalidReason::MalformedTransition(problem));
            }
        }

        if let Some(track) = &config.track {
            if track.steps.is_empty() {
                reasons.push(InvalidReason::EmptyTrack);
            }
            for step in &track.steps {
                if step.duration_ms == 0 {
                    reasons.push(InvalidReason::ZeroStepDuration(step.item_id.clone()));
                }
            }
        }

        for item_id in config.referenced_items() {
            self.check_cached(&item_id, &mut reasons);
        }

        ValidationReport {
            config_id: config.id.clone(),
            valid: reasons.is_empty(),
            reasons,
        }
    }

    pub fn validate_id(&self, config_id: &str) -> Option<ValidationReport> {
        self.configurations
            .get(config_id)
            .map(|config| self.validate(config))
    }

    /// Configurations that are themselves `item_id` or reference it
    pub fn dependents_of(&self, item_id: &str) -> Vec<ItemId> {
        self.configurations
            .values()
            .filter(|config| config.references(item_id))
            .map(|config| config.id.clone())
            .collect()
    }

    pub fn is_referenced(&self, item_id: &str) -> bool {
        self.configurations
            .values()
            .any(|config| config.references(item_id))
    }

    /// Active configurations that passed validation at the last commit
    pub fn displayable_configurations(&self) -> Vec<&PresentationConfiguration> {
        self.configurations
            .values()
            .filter(|config| config.active && config.valid_for_display)
            .collect()
    }

    pub fn is_displayable(&self, config_id: &str) -> bool {
        self.configurations
            .get(config_id)
            .map(|config| config.active && config.valid_for_display)
            .unwrap_or(false)
    }

    /// Enabled groups with at least one displayable configuration, in rotation order
    pub fn displayable_groups(&self) -> Vec<&PresentationGroup> {
        self.groups
            .iter()
            .filter(|group| {
                group.enabled
                    && group
                        .configuration_ids
                        .iter()
                        .any(|id| self.is_displayable(id))
            })
            .collect()
    }

    /// Decide what a reachability sweep removes, leaving `busy` items alone.
    ///
    /// Configurations whose document was dropped from the catalog go first;
    /// a candidate item is then reclaimed only if no remaining configuration
    /// still references it.
    pub fn plan_sweep(&self, busy: &HashSet<ItemId>) -> SweepPlan {
        let removed_configs: Vec<ItemId> = self
            .configurations
            .keys()
            .filter(|id| self.gc_candidates.contains(*id) && !busy.contains(*id))
            .cloned()
            .collect();

        let surviving: Vec<&PresentationConfiguration> = self
            .configurations
            .values()
            .filter(|config| !removed_configs.contains(&config.id))
            .collect();

        let items = self
            .gc_candidates
            .iter()
            .filter(|id| !busy.contains(*id))
            .filter(|id| !surviving.iter().any(|config| config.references(id)))
            .filter_map(|id| self.items.get(id).cloned())
            .collect();

        SweepPlan {
            configurations: removed_configs,
            items,
        }
    }
}
