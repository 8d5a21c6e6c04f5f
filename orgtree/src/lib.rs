//! Outline engine for org-style task files.
//! The tree lives in an arena keyed by stable ids; parsing and formatting are pure
//! text transforms, and every structural edit goes through `Outline` methods.

pub mod core {
    use crate::classify::Grammar;
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
    use indexmap::{IndexMap, IndexSet};
    use serde::{Deserialize, Serialize};
    use std::{
        fmt,
        path::{Path, PathBuf},
    };
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ItemId(pub Uuid);

    impl ItemId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for ItemId {
        fn default() -> Self {
            Self::new()
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Tag(pub String);

    impl From<&str> for Tag {
        fn from(value: &str) -> Self {
            Self(value.to_string())
        }
    }

    impl fmt::Display for Tag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// Priority cookie `[#A]`..`[#C]`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub enum Priority {
        A,
        B,
        C,
    }

    impl Priority {
        pub fn from_char(c: char) -> Option<Self> {
            match c.to_ascii_uppercase() {
                'A' => Some(Self::A),
                'B' => Some(Self::B),
                'C' => Some(Self::C),
                _ => None,
            }
        }

        pub fn as_char(self) -> char {
            match self {
                Self::A => 'A',
                Self::B => 'B',
                Self::C => 'C',
            }
        }
    }

    impl fmt::Display for Priority {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.as_char())
        }
    }

    /// Planning date with an optional time of day (`<2024-01-15 Mon 10:00>`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct Timestamp {
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
    }

    impl Timestamp {
        pub fn on(date: NaiveDate) -> Self {
            Self { date, time: None }
        }

        pub fn at(date: NaiveDate, time: NaiveTime) -> Self {
            Self {
                date,
                time: Some(time),
            }
        }

        pub fn start(&self) -> NaiveDateTime {
            self.date.and_time(self.time.unwrap_or_default())
        }
    }

    /// One `CLOCK:` record; `end == None` means the clock is running.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ClockEntry {
        pub start: NaiveDateTime,
        pub end: Option<NaiveDateTime>,
    }

    impl ClockEntry {
        pub fn open(start: NaiveDateTime) -> Self {
            Self { start, end: None }
        }

        pub fn is_running(&self) -> bool {
            self.end.is_none()
        }

        pub fn elapsed(&self, now: NaiveDateTime) -> Duration {
            self.end.unwrap_or(now) - self.start
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// A heading plus everything up to the next heading.
    ///
    /// `notes` holds the raw body lines and is what gets written back; the
    /// structured fields are derived from it on parse and kept in sync by the
    /// `edit` operations.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Item {
        pub id: ItemId,
        /// Raw marker count from the heading line.
        pub level: usize,
        pub state: Option<String>,
        pub priority: Option<Priority>,
        pub title: String,
        #[serde(default)]
        pub tags: IndexSet<Tag>,
        pub scheduled: Option<Timestamp>,
        pub deadline: Option<Timestamp>,
        pub closed: Option<NaiveDateTime>,
        pub effort: Option<String>,
        #[serde(default)]
        pub notes: Vec<String>,
        #[serde(default)]
        pub clock: Vec<ClockEntry>,
        #[serde(default)]
        pub folded: bool,
        /// Originating file when loaded as part of a directory.
        pub source_file: Option<PathBuf>,
        pub(crate) parent: Option<ItemId>,
        #[serde(default)]
        pub(crate) children: Vec<ItemId>,
    }

    impl Item {
        pub fn new(level: usize, title: impl Into<String>) -> Self {
            Self {
                id: ItemId::new(),
                level,
                state: None,
                priority: None,
                title: title.into(),
                tags: IndexSet::new(),
                scheduled: None,
                deadline: None,
                closed: None,
                effort: None,
                notes: vec![],
                clock: vec![],
                folded: false,
                source_file: None,
                parent: None,
                children: vec![],
            }
        }

        pub fn parent(&self) -> Option<ItemId> {
            self.parent
        }

        pub fn children(&self) -> &[ItemId] {
            &self.children
        }

        pub fn is_clocked_in(&self) -> bool {
            self.clock.iter().any(ClockEntry::is_running)
        }

        pub fn running_clock(&self) -> Option<&ClockEntry> {
            self.clock.iter().rev().find(|entry| entry.is_running())
        }

        pub fn current_clock_duration(&self, now: NaiveDateTime) -> Duration {
            self.running_clock()
                .map(|entry| entry.elapsed(now))
                .unwrap_or_else(Duration::zero)
        }

        pub fn total_clock_duration(&self, now: NaiveDateTime) -> Duration {
            self.clock
                .iter()
                .fold(Duration::zero(), |acc, entry| acc + entry.elapsed(now))
        }

        pub fn has_note_containing(&self, needle: &str) -> bool {
            self.notes.iter().any(|line| line.contains(needle))
        }

        /// Synthetic level-1 item standing for one file of a directory load.
        pub fn is_file_wrapper(&self) -> bool {
            self.parent.is_none() && self.level == 1 && self.source_file.is_some()
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: one document, or a directory of documents under
    /// per-file wrapper items.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Outline {
        pub path: PathBuf,
        pub(crate) roots: Vec<ItemId>,
        pub(crate) items: IndexMap<ItemId, Item>,
        /// Line grammar the edits use to tell code blocks apart from fields.
        #[serde(skip)]
        pub(crate) grammar: Grammar,
    }

    impl Outline {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self {
                path: path.into(),
                roots: vec![],
                items: IndexMap::new(),
                grammar: Grammar::default(),
            }
        }

        pub fn grammar(&self) -> &Grammar {
            &self.grammar
        }

        pub fn set_grammar(&mut self, grammar: Grammar) {
            self.grammar = grammar;
        }

        pub fn roots(&self) -> &[ItemId] {
            &self.roots
        }

        pub fn get(&self, id: ItemId) -> Option<&Item> {
            self.items.get(&id)
        }

        pub fn item(&self, id: ItemId) -> Result<&Item, EditError> {
            self.items.get(&id).ok_or(EditError::UnknownItem)
        }

        pub(crate) fn get_mut(&mut self, id: ItemId) -> Option<&mut Item> {
            self.items.get_mut(&id)
        }

        pub(crate) fn item_mut(&mut self, id: ItemId) -> Result<&mut Item, EditError> {
            self.items.get_mut(&id).ok_or(EditError::UnknownItem)
        }

        pub(crate) fn item_and_grammar(&mut self, id: ItemId) -> Result<(&mut Item, &Grammar), EditError> {
            let item = self.items.get_mut(&id).ok_or(EditError::UnknownItem)?;
            Ok((item, &self.grammar))
        }

        pub fn len(&self) -> usize {
            self.items.len()
        }

        pub fn is_empty(&self) -> bool {
            self.items.is_empty()
        }

        /// A directory load: the first top-level item is a file wrapper.
        pub fn is_multi_document(&self) -> bool {
            self.roots
                .first()
                .and_then(|id| self.items.get(id))
                .is_some_and(|item| item.source_file.is_some())
        }

        /// Every item, depth-first pre-order.
        pub fn preorder(&self) -> Vec<ItemId> {
            let mut out = Vec::with_capacity(self.items.len());
            for id in &self.roots {
                self.collect(*id, false, &mut out);
            }
            out
        }

        /// Pre-order, skipping the descendants of folded items.
        pub fn visible(&self) -> Vec<ItemId> {
            let mut out = Vec::new();
            for id in &self.roots {
                self.collect(*id, true, &mut out);
            }
            out
        }

        /// The item and all of its descendants, pre-order.
        pub fn subtree(&self, id: ItemId) -> Vec<ItemId> {
            let mut out = Vec::new();
            self.collect(id, false, &mut out);
            out
        }

        fn collect(&self, id: ItemId, respect_folds: bool, out: &mut Vec<ItemId>) {
            let Some(item) = self.items.get(&id) else {
                return;
            };
            out.push(id);
            if respect_folds && item.folded {
                return;
            }
            for child in &item.children {
                self.collect(*child, respect_folds, out);
            }
        }

        pub fn root_of(&self, id: ItemId) -> Option<ItemId> {
            let mut current = self.items.get(&id)?;
            while let Some(parent) = current.parent {
                current = self.items.get(&parent)?;
            }
            Some(current.id)
        }

        pub fn file_wrapper_of(&self, id: ItemId) -> Option<ItemId> {
            let root = self.root_of(id)?;
            self.items
                .get(&root)
                .filter(|item| item.is_file_wrapper())
                .map(|item| item.id)
        }

        /// The sibling list `id` lives in (its parent's children, or the roots).
        pub fn siblings(&self, id: ItemId) -> Result<&[ItemId], EditError> {
            match self.item(id)?.parent {
                Some(parent) => Ok(self.item(parent)?.children.as_slice()),
                None => Ok(self.roots.as_slice()),
            }
        }

        /// Children whose level is not their parent's level + 1.
        pub fn level_violations(&self) -> Vec<ItemId> {
            self.items
                .values()
                .filter(|item| match item.parent {
                    Some(parent) => self
                        .items
                        .get(&parent)
                        .is_none_or(|p| item.level != p.level + 1),
                    None => false,
                })
                .map(|item| item.id)
                .collect()
        }

        /// Items with more than one running clock entry.
        pub fn clock_violations(&self) -> Vec<ItemId> {
            self.items
                .values()
                .filter(|item| item.clock.iter().filter(|c| c.is_running()).count() > 1)
                .map(|item| item.id)
                .collect()
        }

        /* ---- arena plumbing ---- */

        pub(crate) fn sibling_list_mut(
            &mut self,
            parent: Option<ItemId>,
        ) -> Result<&mut Vec<ItemId>, EditError> {
            match parent {
                Some(parent) => Ok(&mut self.item_mut(parent)?.children),
                None => Ok(&mut self.roots),
            }
        }

        /// Appends `item` under `parent`, or to the roots when the parent is
        /// absent or unknown.
        pub(crate) fn push_item(&mut self, parent: Option<ItemId>, mut item: Item) -> ItemId {
            let id = item.id;
            let parent = parent.filter(|p| self.items.contains_key(p));
            item.parent = parent;
            self.items.insert(id, item);
            match parent.and_then(|p| self.items.get_mut(&p)) {
                Some(parent) => parent.children.push(id),
                None => self.roots.push(id),
            }
            id
        }

        pub(crate) fn insert_item(
            &mut self,
            parent: Option<ItemId>,
            index: usize,
            mut item: Item,
        ) -> Result<ItemId, EditError> {
            if let Some(parent) = parent {
                self.item(parent)?;
            }
            let id = item.id;
            item.parent = parent;
            self.items.insert(id, item);
            let list = self.sibling_list_mut(parent)?;
            let index = index.min(list.len());
            list.insert(index, id);
            Ok(id)
        }

        /// Unlinks `id` from its sibling list; returns the old parent and index.
        pub(crate) fn detach(&mut self, id: ItemId) -> Result<(Option<ItemId>, usize), EditError> {
            let parent = self.item(id)?.parent;
            let list = self.sibling_list_mut(parent)?;
            let index = list
                .iter()
                .position(|sibling| *sibling == id)
                .ok_or(EditError::UnknownItem)?;
            list.remove(index);
            self.item_mut(id)?.parent = None;
            Ok((parent, index))
        }

        pub(crate) fn attach(
            &mut self,
            id: ItemId,
            parent: Option<ItemId>,
            index: usize,
        ) -> Result<(), EditError> {
            let list = self.sibling_list_mut(parent)?;
            let index = index.min(list.len());
            list.insert(index, id);
            self.item_mut(id)?.parent = parent;
            Ok(())
        }

        pub(crate) fn remove_subtree(&mut self, id: ItemId) {
            for gone in self.subtree(id) {
                self.items.swap_remove(&gone);
            }
        }

        pub(crate) fn shift_levels(&mut self, id: ItemId, delta: isize) {
            for member in self.subtree(id) {
                if let Some(item) = self.items.get_mut(&member) {
                    item.level = item.level.saturating_add_signed(delta).max(1);
                }
            }
        }

        pub(crate) fn stamp_source(&mut self, id: ItemId, file: &Path) {
            for member in self.subtree(id) {
                if let Some(item) = self.items.get_mut(&member) {
                    item.source_file = Some(file.to_path_buf());
                }
            }
        }

        /// Moves every top-level item of `document` under `parent`.
        pub(crate) fn adopt(&mut self, parent: ItemId, document: Outline) -> Vec<ItemId> {
            let Outline { roots, items, .. } = document;
            self.items.extend(items);
            let parent = Some(parent).filter(|p| self.items.contains_key(p));
            for id in &roots {
                if let Some(item) = self.items.get_mut(id) {
                    item.parent = parent;
                }
            }
            match parent.and_then(|p| self.items.get_mut(&p)) {
                Some(parent) => parent.children.extend(roots.iter().copied()),
                None => self.roots.extend(roots.iter().copied()),
            }
            roots
        }

        /// Adds `document` under a new wrapper item named after `file`; the
        /// adopted items move one level down and remember their file.
        pub fn wrap_document(&mut self, file: &Path, document: Outline) -> ItemId {
            let title = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());
            let mut wrapper = Item::new(1, title);
            wrapper.source_file = Some(file.to_path_buf());
            let wrapper_id = self.push_item(None, wrapper);
            for id in self.adopt(wrapper_id, document) {
                self.shift_levels(id, 1);
                self.stamp_source(id, file);
            }
            wrapper_id
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("invalid timestamp: {0}")]
        InvalidTimestamp(String),
        #[error("Invalid date format. Use YYYY-MM-DD or +N")]
        InvalidDateInput(String),
    }

    /// Boundary conditions of the tree operations. Display is the status line
    /// shown to the user; the outline is left untouched.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum EditError {
        #[error("Item not found")]
        UnknownItem,
        #[error("Cannot promote - already at top level")]
        AlreadyTopLevel,
        #[error("Cannot promote - no parent found")]
        NoParent,
        #[error("Cannot move - already at top of list")]
        NoPreviousSibling,
        #[error("Cannot move - already at bottom of list")]
        NoNextSibling,
        #[error("Cannot demote - no previous sibling")]
        NoDemoteTarget,
        #[error("Already clocked in")]
        AlreadyClockedIn,
        #[error("Not clocked in")]
        NotClockedIn,
        #[error("Cannot use an empty title")]
        EmptyTitle,
        #[error("Error: Could not find file to add to")]
        NoFileWrapper,
        #[error("Cannot change file-level items")]
        FileWrapper,
        #[error(transparent)]
        InvalidDate(#[from] DomainError),
    }

    /// Successful result of an edit, rendered as a status line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Outcome {
        StateChanged,
        StateUnchanged,
        Folded,
        Unfolded,
        ClockedIn,
        ClockedOut,
        Deleted,
        MovedUp,
        MovedDown,
        Promoted,
        Demoted,
        Captured { file: Option<String> },
        SubItemAdded,
        Renamed,
        TagsUpdated,
        PrioritySet(Priority),
        PriorityCleared,
        EffortSet,
        EffortCleared,
        DeadlineSet,
        DeadlineCleared,
        ScheduledSet,
        ScheduledCleared,
        NotesSaved,
    }

    impl fmt::Display for Outcome {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Outcome::StateChanged => f.write_str("State changed"),
                Outcome::StateUnchanged => f.write_str("No states configured"),
                Outcome::Folded => f.write_str("Folded"),
                Outcome::Unfolded => f.write_str("Unfolded"),
                Outcome::ClockedIn => f.write_str("Clocked in!"),
                Outcome::ClockedOut => f.write_str("Clocked out!"),
                Outcome::Deleted => f.write_str("Item deleted"),
                Outcome::MovedUp => f.write_str("Item moved up"),
                Outcome::MovedDown => f.write_str("Item moved down"),
                Outcome::Promoted => f.write_str("Item promoted"),
                Outcome::Demoted => f.write_str("Item demoted"),
                Outcome::Captured { file: Some(file) } => write!(f, "TODO captured to {file}"),
                Outcome::Captured { file: None } => f.write_str("TODO captured!"),
                Outcome::SubItemAdded => f.write_str("Sub-task added!"),
                Outcome::Renamed => f.write_str("Item renamed"),
                Outcome::TagsUpdated => f.write_str("Tags updated"),
                Outcome::PrioritySet(p) => write!(f, "Priority set to {p}"),
                Outcome::PriorityCleared => f.write_str("Priority cleared"),
                Outcome::EffortSet => f.write_str("Effort set!"),
                Outcome::EffortCleared => f.write_str("Effort cleared!"),
                Outcome::DeadlineSet => f.write_str("Deadline set!"),
                Outcome::DeadlineCleared => f.write_str("Deadline cleared!"),
                Outcome::ScheduledSet => f.write_str("Scheduled set!"),
                Outcome::ScheduledCleared => f.write_str("Scheduled cleared!"),
                Outcome::NotesSaved => f.write_str("Notes saved"),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn dt(s: &str) -> NaiveDateTime {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").expect("datetime")
        }

        fn sample() -> (Outline, ItemId, ItemId, ItemId) {
            let mut outline = Outline::new("todo.org");
            let a = outline.push_item(None, Item::new(1, "a"));
            let b = outline.push_item(Some(a), Item::new(2, "b"));
            let c = outline.push_item(Some(b), Item::new(3, "c"));
            (outline, a, b, c)
        }

        #[test]
        fn visible_respects_folds() {
            let (mut outline, a, b, c) = sample();
            assert_eq!(outline.visible(), vec![a, b, c]);
            outline.get_mut(b).expect("b").folded = true;
            assert_eq!(outline.visible(), vec![a, b]);
            assert_eq!(outline.preorder(), vec![a, b, c]);
        }

        #[test]
        fn push_item_with_unknown_parent_lands_at_top() {
            let mut outline = Outline::new("todo.org");
            let id = outline.push_item(Some(ItemId::new()), Item::new(2, "orphan"));
            assert_eq!(outline.roots(), &[id]);
            assert_eq!(outline.get(id).and_then(Item::parent), None);
        }

        #[test]
        fn detach_and_attach_keep_links_consistent() {
            let (mut outline, a, b, c) = sample();
            let (parent, index) = outline.detach(c).expect("detach");
            assert_eq!((parent, index), (Some(b), 0));
            outline.attach(c, Some(a), 0).expect("attach");
            assert_eq!(outline.item(a).expect("a").children(), &[c, b]);
            assert_eq!(outline.item(c).expect("c").parent(), Some(a));
        }

        #[test]
        fn clock_durations_sum_closed_and_running_entries() {
            let mut item = Item::new(1, "work");
            item.clock.push(ClockEntry {
                start: dt("2024-01-15 09:00"),
                end: Some(dt("2024-01-15 10:30")),
            });
            item.clock.push(ClockEntry::open(dt("2024-01-15 11:00")));
            let now = dt("2024-01-15 11:15");
            assert!(item.is_clocked_in());
            assert_eq!(item.current_clock_duration(now), Duration::minutes(15));
            assert_eq!(item.total_clock_duration(now), Duration::minutes(105));
        }

        #[test]
        fn wrap_document_shifts_and_stamps() {
            let (document, a, _, c) = sample();
            let mut outline = Outline::new("notes");
            let wrapper = outline.wrap_document(Path::new("notes/a.org"), document);
            assert!(outline.is_multi_document());
            assert_eq!(outline.item(wrapper).expect("wrapper").title, "a.org");
            assert_eq!(outline.item(a).expect("a").level, 2);
            assert_eq!(outline.item(c).expect("c").level, 4);
            assert_eq!(outline.file_wrapper_of(c), Some(wrapper));
            assert_eq!(
                outline.item(c).expect("c").source_file.as_deref(),
                Some(Path::new("notes/a.org"))
            );
            assert!(outline.level_violations().is_empty());
        }

        #[test]
        fn outcome_messages() {
            assert_eq!(Outcome::PrioritySet(Priority::A).to_string(), "Priority set to A");
            assert_eq!(
                Outcome::Captured {
                    file: Some("b.org".into())
                }
                .to_string(),
                "TODO captured to b.org"
            );
            assert_eq!(
                EditError::NoDemoteTarget.to_string(),
                "Cannot demote - no previous sibling"
            );
        }
    }
}

pub mod timestamp {
    //! Codec for the dates inside planning and clock brackets.
    //!
    //! Accepted forms: `2024-01-15`, `2024-01-15 Mon`, `2024-01-15 Mon 10:00`,
    //! `2024-01-15 Mon 10:00:30`. Repeater and warning cookies (`+1w`, `.+2d`,
    //! `-3d`) after the date are tolerated and dropped.

    use crate::core::{DomainError, Timestamp};
    use chrono::{Days, Duration, NaiveDate, NaiveDateTime, NaiveTime};
    use nom::{
        IResult,
        bytes::complete::{take_while, take_while1},
        character::complete::{char, digit1, space0, space1},
        combinator::{all_consuming, map_res, opt, recognize},
        error::{VerboseError, VerboseErrorKind},
        multi::many0,
        sequence::{preceded, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    pub fn parse_org_date(input: &str) -> Result<Timestamp, DomainError> {
        all_consuming(stamp_body)(input.trim())
            .map(|(_, stamp)| stamp)
            .map_err(|_| DomainError::InvalidTimestamp(input.to_string()))
    }

    /// Clock stamps must carry a time of day.
    pub fn parse_clock_stamp(input: &str) -> Result<NaiveDateTime, DomainError> {
        let stamp = parse_org_date(input)?;
        match stamp.time {
            Some(time) => Ok(stamp.date.and_time(time)),
            None => Err(DomainError::InvalidTimestamp(input.to_string())),
        }
    }

    pub fn format_org_date(stamp: &Timestamp) -> String {
        match stamp.time {
            Some(time) => format!("{} {}", stamp.date.format("%Y-%m-%d %a"), time.format("%H:%M")),
            None => stamp.date.format("%Y-%m-%d %a").to_string(),
        }
    }

    pub fn format_clock_stamp(at: &NaiveDateTime) -> String {
        at.format("%Y-%m-%d %a %H:%M").to_string()
    }

    /// `H:MM`, the way org renders clock sums.
    pub fn format_duration(duration: Duration) -> String {
        let minutes = duration.num_minutes().max(0);
        format!("{}:{:02}", minutes / 60, minutes % 60)
    }

    /// Free-form date entry: `+N` days from `today`, `YYYY-MM-DD`,
    /// `YYYY/MM/DD` or `MM/DD/YYYY`.
    pub fn parse_date_input(input: &str, today: NaiveDate) -> Result<NaiveDate, DomainError> {
        let input = input.trim();
        let invalid = || DomainError::InvalidDateInput(input.to_string());
        if let Some(days) = input.strip_prefix('+') {
            let days: u64 = days.trim().parse().map_err(|_| invalid())?;
            return today.checked_add_days(Days::new(days)).ok_or_else(invalid);
        }
        ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"]
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(input, fmt).ok())
            .ok_or_else(invalid)
    }

    fn stamp_body(i: &str) -> PResult<'_, Timestamp> {
        let (i, date) = parse_date(i)?;
        let (i, _weekday) = opt(preceded(space1, take_while1(|c: char| c.is_alphabetic())))(i)?;
        let (i, time) = opt(preceded(space1, parse_time))(i)?;
        let (i, _cookies) = many0(preceded(space1, cookie))(i)?;
        let (i, _) = space0(i)?;
        Ok((i, Timestamp { date, time }))
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((digits(4, 4), char('-'), digits(2, 2), char('-'), digits(2, 2))),
            |(y, _, m, _, d)| {
                NaiveDate::from_ymd_opt(y as i32, m, d).ok_or("invalid calendar date")
            },
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                digits(1, 2),
                char(':'),
                digits(2, 2),
                opt(preceded(char(':'), digits(2, 2))),
            )),
            |(h, _, m, s)| NaiveTime::from_hms_opt(h, m, s.unwrap_or(0)).ok_or("invalid time"),
        )(i)
    }

    /// `+1w`, `++2d`, `.+1m`, `-3d`.
    fn cookie(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            take_while1(|c: char| matches!(c, '+' | '-' | '.')),
            digit1,
            take_while1(|c: char| c.is_ascii_alphabetic()),
        )))(i)
    }

    fn digits(min: usize, max: usize) -> impl Fn(&str) -> PResult<'_, u32> {
        move |i: &str| {
            let (rest, run) = take_while(|c: char| c.is_ascii_digit())(i)?;
            let fail = || {
                nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("digits"))],
                })
            };
            if run.len() < min || run.len() > max {
                return Err(fail());
            }
            run.parse::<u32>().map(|n| (rest, n)).map_err(|_| fail())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).expect("date")
        }

        #[test]
        fn accepts_all_planning_forms() {
            let plain = parse_org_date("2024-01-15").expect("parse");
            assert_eq!(plain, Timestamp::on(date(2024, 1, 15)));

            let weekday = parse_org_date("2024-01-15 Mon").expect("parse");
            assert_eq!(weekday, Timestamp::on(date(2024, 1, 15)));

            let timed = parse_org_date("2024-01-15 Mon 9:05").expect("parse");
            assert_eq!(
                timed.time,
                Some(NaiveTime::from_hms_opt(9, 5, 0).expect("time"))
            );
        }

        #[test]
        fn tolerates_repeaters() {
            let stamp = parse_org_date("2024-01-15 Mon 10:00 +1w -2d").expect("parse");
            assert_eq!(stamp.date, date(2024, 1, 15));
            assert!(stamp.time.is_some());
        }

        #[test]
        fn rejects_garbage() {
            assert!(parse_org_date("tomorrow").is_err());
            assert!(parse_org_date("2024-13-40").is_err());
            assert!(parse_org_date("2024-01-15 Mon 10:00 trailing words").is_err());
        }

        #[test]
        fn clock_stamp_needs_time_and_accepts_seconds() {
            assert!(parse_clock_stamp("2024-01-15 Mon").is_err());
            let at = parse_clock_stamp("2024-01-15 Mon 10:00:30").expect("parse");
            assert_eq!(at, date(2024, 1, 15).and_hms_opt(10, 0, 30).expect("dt"));
        }

        #[test]
        fn formatting_uses_weekday_and_optional_time() {
            let stamp = Timestamp::on(date(2024, 1, 15));
            assert_eq!(format_org_date(&stamp), "2024-01-15 Mon");
            let timed = Timestamp::at(date(2024, 1, 15), NaiveTime::from_hms_opt(8, 0, 0).expect("t"));
            assert_eq!(format_org_date(&timed), "2024-01-15 Mon 08:00");
            let at = date(2024, 1, 16).and_hms_opt(17, 45, 12).expect("dt");
            assert_eq!(format_clock_stamp(&at), "2024-01-16 Tue 17:45");
        }

        #[test]
        fn duration_renders_hours_and_minutes() {
            assert_eq!(format_duration(Duration::minutes(125)), "2:05");
            assert_eq!(format_duration(Duration::zero()), "0:00");
        }

        #[test]
        fn date_input_forms() {
            let today = date(2024, 1, 30);
            assert_eq!(parse_date_input("+3", today), Ok(date(2024, 2, 2)));
            assert_eq!(parse_date_input("2024-03-01", today), Ok(date(2024, 3, 1)));
            assert_eq!(parse_date_input("2024/03/01", today), Ok(date(2024, 3, 1)));
            assert_eq!(parse_date_input("03/01/2024", today), Ok(date(2024, 3, 1)));
            assert!(parse_date_input("next week", today).is_err());
            assert!(parse_date_input("+x", today).is_err());
        }
    }
}

pub mod classify {
    //! Single-line matchers for the outline grammar: headings, drawer and
    //! code-fence boundaries, and the planning/clock/effort fields found in
    //! body lines.

    use crate::core::{ClockEntry, Item, Priority, Tag, Timestamp};
    use crate::timestamp::{parse_clock_stamp, parse_org_date};
    use chrono::NaiveDateTime;
    use nom::{
        IResult,
        bytes::complete::{tag, take_till1, take_while1},
        character::complete::{char, multispace0, one_of},
        error::VerboseError,
        sequence::{delimited, pair, preceded, terminated},
    };
    use std::ops::Range;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    pub const DEFAULT_STATES: [&str; 4] = ["TODO", "PROG", "BLOCK", "DONE"];

    /// Everything the line matchers need to know about the user's setup.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Grammar {
        pub states: Vec<String>,
        pub marker: char,
        pub org_fence_open: String,
        pub org_fence_close: String,
        pub markdown_fence: String,
    }

    impl Default for Grammar {
        fn default() -> Self {
            Self::with_states(DEFAULT_STATES)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DrawerKind {
        Logbook,
        Properties,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DrawerLine {
        Start(DrawerKind),
        End,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FenceKind {
        Org,
        Markdown,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FenceLine {
        OrgOpen,
        OrgClose,
        /// Markdown fences open and close with the same line.
        Markdown,
    }

    impl FenceLine {
        pub fn opens(self) -> Option<FenceKind> {
            match self {
                FenceLine::OrgOpen => Some(FenceKind::Org),
                FenceLine::Markdown => Some(FenceKind::Markdown),
                FenceLine::OrgClose => None,
            }
        }

        pub fn closes(self, open: FenceKind) -> bool {
            matches!(
                (self, open),
                (FenceLine::OrgClose, FenceKind::Org) | (FenceLine::Markdown, FenceKind::Markdown)
            )
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct HeadingLine<'a> {
        pub level: usize,
        pub state: Option<&'a str>,
        pub priority: Option<Priority>,
        pub title: &'a str,
        pub tags: Vec<&'a str>,
    }

    impl HeadingLine<'_> {
        pub fn into_item(self) -> Item {
            let mut item = Item::new(self.level, self.title);
            item.state = self.state.map(str::to_string);
            item.priority = self.priority;
            item.tags = self.tags.into_iter().map(Tag::from).collect();
            item
        }
    }

    /// Structured fields recognized on one body line.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ContentFields {
        pub scheduled: Option<Timestamp>,
        pub deadline: Option<Timestamp>,
        pub closed: Option<NaiveDateTime>,
        pub clock: Option<ClockEntry>,
        pub effort: Option<String>,
    }

    /// A `KEY <inner>` segment located inside a line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Marker<'a> {
        pub span: Range<usize>,
        pub inner: &'a str,
    }

    impl Grammar {
        pub fn with_states<I, S>(states: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                states: states.into_iter().map(Into::into).collect(),
                marker: '*',
                org_fence_open: "#+BEGIN_SRC".to_string(),
                org_fence_close: "#+END_SRC".to_string(),
                markdown_fence: "```".to_string(),
            }
        }

        pub fn fence(&self, line: &str) -> Option<FenceLine> {
            let line = line.trim_start();
            if starts_with_ignore_case(line, &self.org_fence_open) {
                Some(FenceLine::OrgOpen)
            } else if starts_with_ignore_case(line, &self.org_fence_close) {
                Some(FenceLine::OrgClose)
            } else if !self.markdown_fence.is_empty() && line.starts_with(&self.markdown_fence) {
                Some(FenceLine::Markdown)
            } else {
                None
            }
        }

        /// `<marker>+ [STATE ][[#P] ]title[ :tag:tag:]`
        pub fn heading<'a>(&self, line: &'a str) -> Option<HeadingLine<'a>> {
            let marker = self.marker;
            let parsed: PResult<'a, &'a str> = terminated(
                take_while1(move |c: char| c == marker),
                take_while1(|c: char| c.is_ascii_whitespace()),
            )(line);
            let (body, markers) = parsed.ok()?;
            let level = markers.chars().count();
            let body = body.trim_end();
            if body.is_empty() {
                return None;
            }

            let (state, body) = match self.state_prefix(body) {
                Some((state, rest)) => (Some(state), rest),
                None => (None, body),
            };
            let (priority, body) = match priority_cookie(body) {
                Some((priority, rest)) => (Some(priority), rest),
                None => (None, body),
            };
            let (title, tags) = split_tags(body);
            Some(HeadingLine {
                level,
                state,
                priority,
                title,
                tags,
            })
        }

        fn state_prefix<'a>(&self, body: &'a str) -> Option<(&'a str, &'a str)> {
            self.states.iter().filter(|s| !s.is_empty()).find_map(|state| {
                let rest = body.strip_prefix(state.as_str())?;
                let after = rest.trim_start_matches(|c: char| c.is_ascii_whitespace());
                (after.len() < rest.len() && !after.is_empty()).then(|| (&body[..state.len()], after))
            })
        }
    }

    pub fn drawer_boundary(line: &str) -> Option<DrawerLine> {
        match line.trim() {
            ":LOGBOOK:" => Some(DrawerLine::Start(DrawerKind::Logbook)),
            ":PROPERTIES:" => Some(DrawerLine::Start(DrawerKind::Properties)),
            ":END:" => Some(DrawerLine::End),
            _ => None,
        }
    }

    /// Recognizes SCHEDULED, DEADLINE, CLOSED, CLOCK and `:EFFORT:` on a body
    /// line. Unparseable dates leave the field unset.
    pub fn content(line: &str) -> ContentFields {
        ContentFields {
            scheduled: planning_date(line, "SCHEDULED:"),
            deadline: planning_date(line, "DEADLINE:"),
            closed: find_marker(line, "CLOSED:", '[', ']').and_then(|m| {
                parse_org_date(m.inner)
                    .map(|stamp| stamp.start())
                    .map_err(|err| tracing::debug!(%err, "ignoring CLOSED stamp"))
                    .ok()
            }),
            clock: clock_entry(line),
            effort: effort_value(line),
        }
    }

    /// First `KEY <...>` (or `KEY [...]`) segment in `line`, allowing
    /// whitespace between the key and the bracket.
    pub fn find_marker<'a>(line: &'a str, key: &str, open: char, close: char) -> Option<Marker<'a>> {
        line.match_indices(key).find_map(|(pos, _)| {
            let parsed: PResult<'a, &'a str> = preceded(
                pair(tag(key), multispace0),
                delimited(char(open), take_till1(move |c: char| c == close), char(close)),
            )(&line[pos..]);
            parsed.ok().map(|(rest, inner)| Marker {
                span: pos..line.len() - rest.len(),
                inner,
            })
        })
    }

    fn planning_date(line: &str, key: &str) -> Option<Timestamp> {
        let marker = find_marker(line, key, '<', '>')?;
        parse_org_date(marker.inner)
            .map_err(|err| tracing::debug!(%err, key, "ignoring planning stamp"))
            .ok()
    }

    fn clock_entry(line: &str) -> Option<ClockEntry> {
        let marker = find_marker(line, "CLOCK:", '[', ']')?;
        let start = parse_clock_stamp(marker.inner)
            .map_err(|err| tracing::debug!(%err, "ignoring CLOCK line"))
            .ok()?;
        let tail = &line[marker.span.end..];
        let end: PResult<'_, &str> = preceded(
            tag("--"),
            delimited(char('['), take_till1(|c: char| c == ']'), char(']')),
        )(tail);
        match end {
            Ok((_, raw)) => match parse_clock_stamp(raw) {
                Ok(end) => Some(ClockEntry {
                    start,
                    end: Some(end),
                }),
                Err(err) => {
                    tracing::debug!(%err, "ignoring CLOCK line with bad end");
                    None
                }
            },
            Err(_) => Some(ClockEntry::open(start)),
        }
    }

    fn effort_value(line: &str) -> Option<String> {
        let rest = line.trim_start().strip_prefix(':')?;
        let (key, value) = rest.split_once(':')?;
        if !key.eq_ignore_ascii_case("EFFORT") {
            return None;
        }
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    fn priority_cookie(body: &str) -> Option<(Priority, &str)> {
        let parsed: PResult<'_, char> = terminated(
            delimited(tag("[#"), one_of("ABC"), char(']')),
            take_while1(|c: char| c.is_ascii_whitespace()),
        )(body);
        let (rest, letter) = parsed.ok()?;
        if rest.is_empty() {
            return None;
        }
        Some((Priority::from_char(letter)?, rest))
    }

    /// Splits a trailing `:a:b:` cluster off the title.
    fn split_tags(body: &str) -> (&str, Vec<&str>) {
        let Some(pos) = body.rfind(|c: char| c.is_ascii_whitespace()) else {
            return (body, vec![]);
        };
        let cluster = body[pos..].trim_start();
        let title = body[..pos].trim_end();
        if title.is_empty() || !is_tag_cluster(cluster) {
            return (body, vec![]);
        }
        let tags = cluster.split(':').filter(|t| !t.is_empty()).collect();
        (title, tags)
    }

    fn is_tag_cluster(s: &str) -> bool {
        s.len() >= 3
            && s.starts_with(':')
            && s.ends_with(':')
            && s.chars()
                .all(|c| c == ':' || c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '#' | '%'))
    }

    fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
        !prefix.is_empty()
            && line
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        #[test]
        fn heading_with_everything() {
            let grammar = Grammar::default();
            let h = grammar
                .heading("** TODO [#A] Write report :work:urgent:")
                .expect("heading");
            assert_eq!(h.level, 2);
            assert_eq!(h.state, Some("TODO"));
            assert_eq!(h.priority, Some(Priority::A));
            assert_eq!(h.title, "Write report");
            assert_eq!(h.tags, vec!["work", "urgent"]);
        }

        #[test]
        fn state_word_needs_to_stand_alone() {
            let grammar = Grammar::default();
            let h = grammar.heading("* TODOS are piling up").expect("heading");
            assert_eq!(h.state, None);
            assert_eq!(h.title, "TODOS are piling up");

            let only_state = grammar.heading("* DONE").expect("heading");
            assert_eq!(only_state.state, None);
            assert_eq!(only_state.title, "DONE");
        }

        #[test]
        fn unknown_words_stay_in_title() {
            let grammar = Grammar::with_states(["NEXT", "DONE"]);
            let h = grammar.heading("* TODO call mom").expect("heading");
            assert_eq!(h.state, None);
            assert_eq!(h.title, "TODO call mom");
            let h = grammar.heading("* NEXT call mom").expect("heading");
            assert_eq!(h.state, Some("NEXT"));
        }

        #[test]
        fn non_headings() {
            let grammar = Grammar::default();
            assert!(grammar.heading("*bold* text").is_none());
            assert!(grammar.heading("**   ").is_none());
            assert!(grammar.heading("plain").is_none());
        }

        #[test]
        fn tag_like_text_without_space_is_title() {
            let grammar = Grammar::default();
            let h = grammar.heading("* ratio 1:2:3 here:").expect("heading");
            assert_eq!(h.title, "ratio 1:2:3 here:");
            assert!(h.tags.is_empty());
        }

        #[test]
        fn custom_marker() {
            let grammar = Grammar {
                marker: '#',
                ..Grammar::default()
            };
            let h = grammar.heading("## PROG Refactor").expect("heading");
            assert_eq!(h.level, 2);
            assert_eq!(h.state, Some("PROG"));
            assert!(grammar.heading("** PROG Refactor").is_none());
        }

        #[test]
        fn drawer_and_fence_lines() {
            let grammar = Grammar::default();
            assert_eq!(
                drawer_boundary("  :LOGBOOK:  "),
                Some(DrawerLine::Start(DrawerKind::Logbook))
            );
            assert_eq!(drawer_boundary(":END:"), Some(DrawerLine::End));
            assert_eq!(drawer_boundary(":END: trailing"), None);
            assert_eq!(grammar.fence("  #+begin_src rust"), Some(FenceLine::OrgOpen));
            assert_eq!(grammar.fence("#+END_SRC"), Some(FenceLine::OrgClose));
            assert_eq!(grammar.fence("```python"), Some(FenceLine::Markdown));
            assert!(FenceLine::Markdown.closes(FenceKind::Markdown));
            assert!(!FenceLine::OrgClose.closes(FenceKind::Markdown));
        }

        #[test]
        fn planning_line_with_several_fields() {
            let fields = content("CLOSED: [2024-01-14 Sun 18:00] SCHEDULED: <2024-01-15 Mon> DEADLINE: <2024-01-20 Sat 12:00>");
            let day = |d| NaiveDate::from_ymd_opt(2024, 1, d).expect("date");
            assert_eq!(fields.scheduled.map(|s| s.date), Some(day(15)));
            assert_eq!(fields.deadline.map(|s| s.date), Some(day(20)));
            assert!(fields.deadline.and_then(|s| s.time).is_some());
            assert_eq!(fields.closed.map(|c| c.date()), Some(day(14)));
        }

        #[test]
        fn bad_dates_leave_fields_unset() {
            let fields = content("SCHEDULED: <someday>");
            assert_eq!(fields, ContentFields::default());
        }

        #[test]
        fn clock_lines() {
            let open = content("  CLOCK: [2024-01-15 Mon 09:00]").clock.expect("clock");
            assert!(open.is_running());

            let closed = content("CLOCK: [2024-01-15 Mon 09:00]--[2024-01-15 Mon 10:30] =>  1:30")
                .clock
                .expect("clock");
            assert_eq!(
                closed.elapsed(closed.start).num_minutes(),
                90
            );

            assert!(content("CLOCK: [2024-01-15 Mon 09:00]--[nonsense]").clock.is_none());
            assert!(content("CLOCK: [2024-01-15 Mon]").clock.is_none());
        }

        #[test]
        fn effort_property() {
            assert_eq!(content("  :EFFORT: 2h ").effort.as_deref(), Some("2h"));
            assert_eq!(content(":Effort: 1d").effort.as_deref(), Some("1d"));
            assert_eq!(content(":EFFORT:").effort, None);
            assert_eq!(content(":OWNER: me").effort, None);
        }

        #[test]
        fn marker_span_covers_key_and_brackets() {
            let line = "  DEADLINE: <2024-01-20 Sat> rest";
            let marker = find_marker(line, "DEADLINE:", '<', '>').expect("marker");
            assert_eq!(&line[marker.span.clone()], "DEADLINE: <2024-01-20 Sat>");
            assert_eq!(marker.inner, "2024-01-20 Sat");
        }
    }
}

pub mod config {
    //! User configuration, stored as TOML:
    //!
    //! ```toml
    //! [states]
    //! default_new_task_state = "TODO"
    //! [[states.states]]
    //! name = "TODO"
    //! [[states.states]]
    //! name = "DONE"
    //!
    //! [syntax]
    //! heading_marker = "*"
    //! org_fence_open = "#+BEGIN_SRC"
    //! org_fence_close = "#+END_SRC"
    //! markdown_fence = "```"
    //!
    //! [agenda]
    //! days = 7
    //! ```

    use crate::classify::{DEFAULT_STATES, Grammar};
    use serde::{Deserialize, Serialize};
    use std::{
        fs, io,
        path::{Path, PathBuf},
    };

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("failed to read config {path:?}")]
        Read {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("failed to parse config {path:?}")]
        Parse {
            path: PathBuf,
            #[source]
            source: toml::de::Error,
        },
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Config {
        pub states: StatesConfig,
        pub syntax: SyntaxConfig,
        pub agenda: AgendaConfig,
    }

    /// Workflow states in cycle order; the last one is the terminal state.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct StatesConfig {
        pub states: Vec<StateConfig>,
        /// Empty means new items get no state.
        pub default_new_task_state: String,
    }

    impl Default for StatesConfig {
        fn default() -> Self {
            Self {
                states: DEFAULT_STATES.iter().map(|name| StateConfig::named(name)).collect(),
                default_new_task_state: "TODO".to_string(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StateConfig {
        pub name: String,
    }

    impl StateConfig {
        pub fn named(name: &str) -> Self {
            Self {
                name: name.to_string(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct SyntaxConfig {
        pub heading_marker: char,
        pub org_fence_open: String,
        pub org_fence_close: String,
        pub markdown_fence: String,
    }

    impl Default for SyntaxConfig {
        fn default() -> Self {
            let grammar = Grammar::default();
            Self {
                heading_marker: grammar.marker,
                org_fence_open: grammar.org_fence_open,
                org_fence_close: grammar.org_fence_close,
                markdown_fence: grammar.markdown_fence,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct AgendaConfig {
        /// Items dated before today + `days` show up.
        pub days: u64,
    }

    impl Default for AgendaConfig {
        fn default() -> Self {
            Self { days: 7 }
        }
    }

    impl Config {
        /// `<config dir>/orgtree/config.toml`.
        pub fn default_path() -> Option<PathBuf> {
            dirs::config_dir().map(|dir| dir.join("orgtree").join("config.toml"))
        }

        /// Reads `path`; a missing file yields the defaults.
        pub fn load(path: &Path) -> Result<Self, ConfigError> {
            let text = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(?path, "no config file, using defaults");
                    return Ok(Self::default());
                }
                Err(source) => {
                    return Err(ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            };
            Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
        }

        pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
            let mut config: Config = toml::from_str(text)?;
            config.fill_defaults();
            Ok(config)
        }

        pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
            toml::to_string_pretty(self)
        }

        fn fill_defaults(&mut self) {
            self.states.states.retain(|state| !state.name.trim().is_empty());
            if self.states.states.is_empty() {
                self.states.states = StatesConfig::default().states;
            }
            if self.syntax.markdown_fence.trim().is_empty() {
                self.syntax.markdown_fence = SyntaxConfig::default().markdown_fence;
            }
        }

        pub fn state_names(&self) -> Vec<String> {
            self.states.states.iter().map(|s| s.name.clone()).collect()
        }

        /// The configured default if it names a known state, none if empty,
        /// otherwise the first state.
        pub fn default_new_task_state(&self) -> Option<String> {
            let wanted = self.states.default_new_task_state.trim();
            if wanted.is_empty() {
                return None;
            }
            let names = self.state_names();
            if names.iter().any(|name| name == wanted) {
                Some(wanted.to_string())
            } else {
                names.into_iter().next()
            }
        }

        pub fn grammar(&self) -> Grammar {
            Grammar {
                states: self.state_names(),
                marker: self.syntax.heading_marker,
                org_fence_open: self.syntax.org_fence_open.clone(),
                org_fence_close: self.syntax.org_fence_close.clone(),
                markdown_fence: self.syntax.markdown_fence.clone(),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn empty_file_gives_defaults() {
            let config = Config::from_toml_str("").expect("parse");
            assert_eq!(config, Config::default());
            assert_eq!(config.state_names(), vec!["TODO", "PROG", "BLOCK", "DONE"]);
            assert_eq!(config.default_new_task_state().as_deref(), Some("TODO"));
            assert_eq!(config.agenda.days, 7);
        }

        #[test]
        fn custom_states_and_marker() {
            let config = Config::from_toml_str(
                r##"
                [states]
                default_new_task_state = "NEXT"
                [[states.states]]
                name = "NEXT"
                color = "#00ff00"
                [[states.states]]
                name = "WAIT"
                [[states.states]]
                name = "DONE"

                [syntax]
                heading_marker = "#"
                "##,
            )
            .expect("parse");
            let grammar = config.grammar();
            assert_eq!(grammar.states, vec!["NEXT", "WAIT", "DONE"]);
            assert_eq!(grammar.marker, '#');
            assert_eq!(grammar.org_fence_open, "#+BEGIN_SRC");
            assert_eq!(config.default_new_task_state().as_deref(), Some("NEXT"));
        }

        #[test]
        fn default_state_resolution() {
            let mut config = Config::default();
            config.states.default_new_task_state = "LATER".into();
            assert_eq!(config.default_new_task_state().as_deref(), Some("TODO"));
            config.states.default_new_task_state = String::new();
            assert_eq!(config.default_new_task_state(), None);
        }

        #[test]
        fn empty_state_list_falls_back() {
            let config = Config::from_toml_str("[states]\nstates = []\n").expect("parse");
            assert_eq!(config.state_names().len(), 4);
        }

        #[test]
        fn load_missing_and_broken_files() {
            let dir = tempfile::tempdir().expect("tempdir");
            let missing = Config::load(&dir.path().join("nope.toml")).expect("defaults");
            assert_eq!(missing, Config::default());

            let broken = dir.path().join("config.toml");
            fs::write(&broken, "[states\n").expect("write");
            assert!(matches!(Config::load(&broken), Err(ConfigError::Parse { .. })));
        }

        #[test]
        fn serialized_config_reloads() {
            let config = Config::default();
            let text = config.to_toml_string().expect("serialize");
            assert_eq!(Config::from_toml_str(&text).expect("parse"), config);
        }
    }
}

pub mod parser {
    //! Line-oriented outline parser.
    //!
    //! Parsing strategy:
    //! - `tokenize` walks the lines once, tracking drawer and code-block state,
    //!   and classifies every line into a `Token`.
    //! - `build_outline` consumes the tokens and attaches each heading to the
    //!   nearest open heading with a smaller level (a level-keyed stack).
    //! Neither step does I/O.

    use crate::classify::{
        ContentFields, DrawerKind, DrawerLine, FenceKind, Grammar, HeadingLine, content,
        drawer_boundary,
    };
    use crate::core::{Item, ItemId, Outline};
    use std::path::PathBuf;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Token<'a> {
        /// Drawer or fence boundary line.
        Delimiter(&'a str),
        /// Line inside a code block.
        Verbatim(&'a str),
        Heading(HeadingLine<'a>),
        Content {
            raw: &'a str,
            fields: ContentFields,
        },
    }

    pub fn parse_outline(path: impl Into<PathBuf>, input: &str, grammar: &Grammar) -> Outline {
        let mut outline = build_outline(path.into(), tokenize(input, grammar));
        outline.set_grammar(grammar.clone());
        outline
    }

    pub fn tokenize<'a>(input: &'a str, grammar: &Grammar) -> Vec<Token<'a>> {
        tokenize_lines(input.lines(), grammar)
    }

    /// One token per line of `lines`.
    pub fn tokenize_lines<'a>(lines: impl IntoIterator<Item = &'a str>, grammar: &Grammar) -> Vec<Token<'a>> {
        let mut tokens = Vec::new();
        let mut drawer: Option<DrawerKind> = None;
        let mut code: Option<FenceKind> = None;

        for line in lines {
            if let Some(open) = code {
                match grammar.fence(line) {
                    Some(edge) if edge.closes(open) => {
                        code = None;
                        tokens.push(Token::Delimiter(line));
                    }
                    _ => tokens.push(Token::Verbatim(line)),
                }
                continue;
            }

            match drawer_boundary(line) {
                Some(DrawerLine::Start(kind)) => {
                    drawer = Some(kind);
                    tokens.push(Token::Delimiter(line));
                    continue;
                }
                Some(DrawerLine::End) if drawer.is_some() => {
                    drawer = None;
                    tokens.push(Token::Delimiter(line));
                    continue;
                }
                _ => {}
            }

            if let Some(edge) = grammar.fence(line) {
                code = edge.opens();
                tokens.push(Token::Delimiter(line));
                continue;
            }

            if drawer.is_none() {
                if let Some(heading) = grammar.heading(line) {
                    tokens.push(Token::Heading(heading));
                    continue;
                }
            }

            tokens.push(Token::Content {
                raw: line,
                fields: content(line),
            });
        }
        tokens
    }

    pub fn build_outline<'a>(path: PathBuf, tokens: impl IntoIterator<Item = Token<'a>>) -> Outline {
        let mut outline = Outline::new(path);
        let mut open: Vec<(usize, ItemId)> = Vec::new();
        let mut current: Option<ItemId> = None;

        for token in tokens {
            match token {
                Token::Heading(heading) => {
                    while open.last().is_some_and(|&(level, _)| level >= heading.level) {
                        open.pop();
                    }
                    let parent = open.last().map(|&(_, id)| id);
                    let level = heading.level;
                    let id = outline.push_item(parent, heading.into_item());
                    open.push((level, id));
                    current = Some(id);
                }
                Token::Delimiter(raw) | Token::Verbatim(raw) => {
                    if let Some(item) = current.and_then(|id| outline.get_mut(id)) {
                        item.notes.push(raw.to_string());
                    }
                }
                Token::Content { raw, fields } => {
                    if let Some(item) = current.and_then(|id| outline.get_mut(id)) {
                        apply_fields(item, fields);
                        item.notes.push(raw.to_string());
                    }
                }
            }
        }
        outline
    }

    /// Marks the note lines that belong to a code block, fences included.
    /// Field matchers must leave those lines alone.
    pub(crate) fn verbatim_lines(notes: &[String], grammar: &Grammar) -> Vec<bool> {
        tokenize_lines(notes.iter().map(String::as_str), grammar)
            .into_iter()
            .map(|token| match token {
                Token::Verbatim(_) => true,
                Token::Delimiter(raw) => grammar.fence(raw).is_some(),
                Token::Heading(_) | Token::Content { .. } => false,
            })
            .collect()
    }

    /// Copies recognized fields onto `item`; a later line overrides an earlier
    /// one. A second running clock entry is ignored.
    pub(crate) fn apply_fields(item: &mut Item, fields: ContentFields) {
        if let Some(stamp) = fields.scheduled {
            item.scheduled = Some(stamp);
        }
        if let Some(stamp) = fields.deadline {
            item.deadline = Some(stamp);
        }
        if let Some(at) = fields.closed {
            item.closed = Some(at);
        }
        if let Some(effort) = fields.effort {
            item.effort = Some(effort);
        }
        if let Some(entry) = fields.clock {
            if entry.is_running() && item.is_clocked_in() {
                tracing::debug!(title = %item.title, "ignoring second running clock");
            } else {
                item.clock.push(entry);
            }
        }
    }

}

pub mod edit {
    //! Tree and field edits on an `Outline`.
    //!
    //! Each operation either applies completely or returns an `EditError` with
    //! the outline untouched. Wall-clock time is always passed in. Setters that
    //! touch a field with a literal line in `notes` rewrite that line too, so the
    //! text written back agrees with the field.

    use crate::classify::{Grammar, content, find_marker};
    use crate::core::{ClockEntry, EditError, Item, ItemId, Outcome, Outline, Priority, Tag, Timestamp};
    use crate::parser::{apply_fields, verbatim_lines};
    use crate::timestamp::{format_clock_stamp, format_org_date, parse_date_input};
    use chrono::{NaiveDate, NaiveDateTime};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Direction {
        Forward,
        Backward,
    }

    /// State after one step through `states`, with an implicit "none" slot
    /// on either end. Unknown states count as none.
    pub fn next_state(current: Option<&str>, states: &[String], direction: Direction) -> Option<String> {
        let Some(last) = states.len().checked_sub(1) else {
            return current.map(str::to_string);
        };
        let index = current.and_then(|state| states.iter().position(|s| s == state));
        match direction {
            Direction::Forward => match index {
                Some(i) if i == last => None,
                Some(i) => Some(states[i + 1].clone()),
                None => Some(states[0].clone()),
            },
            Direction::Backward => match (current, index) {
                (None, _) => Some(states[last].clone()),
                (Some(_), None) | (Some(_), Some(0)) => None,
                (Some(_), Some(i)) => Some(states[i - 1].clone()),
            },
        }
    }

    impl Outline {
        pub fn toggle_fold(&mut self, id: ItemId) -> Result<Outcome, EditError> {
            let item = self.item_mut(id)?;
            item.folded = !item.folded;
            Ok(if item.folded {
                Outcome::Folded
            } else {
                Outcome::Unfolded
            })
        }

        /// Entering the last state closes the item (and stops a running clock);
        /// leaving it reopens the item.
        pub fn cycle_state(
            &mut self,
            id: ItemId,
            direction: Direction,
            states: &[String],
            now: NaiveDateTime,
        ) -> Result<Outcome, EditError> {
            let (item, grammar) = self.item_and_grammar(id)?;
            if states.is_empty() {
                return Ok(Outcome::StateUnchanged);
            }
            let next = next_state(item.state.as_deref(), states, direction);
            transition(item, grammar, next, states, now);
            Ok(Outcome::StateChanged)
        }

        pub fn set_state(
            &mut self,
            id: ItemId,
            state: Option<&str>,
            states: &[String],
            now: NaiveDateTime,
        ) -> Result<Outcome, EditError> {
            let (item, grammar) = self.item_and_grammar(id)?;
            transition(item, grammar, state.map(str::to_string), states, now);
            Ok(Outcome::StateChanged)
        }

        pub fn clock_in(&mut self, id: ItemId, now: NaiveDateTime) -> Result<Outcome, EditError> {
            let (item, grammar) = self.item_and_grammar(id)?;
            if item.is_clocked_in() {
                return Err(EditError::AlreadyClockedIn);
            }
            item.clock.push(ClockEntry::open(now));
            if let Some(drawer) = logbook_line(item, grammar) {
                let indent = indent_of(&item.notes[drawer]).to_string();
                item.notes
                    .insert(drawer + 1, format!("{indent}CLOCK: [{}]", format_clock_stamp(&now)));
            }
            Ok(Outcome::ClockedIn)
        }

        pub fn clock_out(&mut self, id: ItemId, now: NaiveDateTime) -> Result<Outcome, EditError> {
            let (item, grammar) = self.item_and_grammar(id)?;
            stop_clock(item, grammar, now)?;
            Ok(Outcome::ClockedOut)
        }

        /// Removes the item and its whole subtree.
        pub fn delete(&mut self, id: ItemId) -> Result<Outcome, EditError> {
            self.detach(id)?;
            self.remove_subtree(id);
            Ok(Outcome::Deleted)
        }

        pub fn move_up(&mut self, id: ItemId) -> Result<Outcome, EditError> {
            let parent = self.item(id)?.parent();
            let list = self.sibling_list_mut(parent)?;
            let index = position(list, id)?;
            if index == 0 {
                return Err(EditError::NoPreviousSibling);
            }
            list.swap(index, index - 1);
            Ok(Outcome::MovedUp)
        }

        pub fn move_down(&mut self, id: ItemId) -> Result<Outcome, EditError> {
            let parent = self.item(id)?.parent();
            let list = self.sibling_list_mut(parent)?;
            let index = position(list, id)?;
            if index + 1 >= list.len() {
                return Err(EditError::NoNextSibling);
            }
            list.swap(index, index + 1);
            Ok(Outcome::MovedDown)
        }

        /// Re-homes the item right after its parent, one level up.
        pub fn promote(&mut self, id: ItemId) -> Result<Outcome, EditError> {
            let item = self.item(id)?;
            if item.level <= 1 {
                return Err(EditError::AlreadyTopLevel);
            }
            let Some(parent) = item.parent() else {
                return Err(EditError::NoParent);
            };
            let parent_item = self.item(parent)?;
            if parent_item.is_file_wrapper() {
                return Err(EditError::AlreadyTopLevel);
            }
            let grandparent = parent_item.parent();
            let after = position(self.siblings(parent)?, parent)? + 1;

            self.detach(id)?;
            self.attach(id, grandparent, after)?;
            self.shift_levels(id, -1);
            Ok(Outcome::Promoted)
        }

        /// Makes the item the last child of its previous sibling.
        pub fn demote(&mut self, id: ItemId) -> Result<Outcome, EditError> {
            if self.item(id)?.is_file_wrapper() {
                return Err(EditError::FileWrapper);
            }
            let siblings = self.siblings(id)?;
            let index = position(siblings, id)?;
            if index == 0 {
                return Err(EditError::NoDemoteTarget);
            }
            let new_parent = siblings[index - 1];

            self.detach(id)?;
            self.attach(id, Some(new_parent), usize::MAX)?;
            self.shift_levels(id, 1);
            self.item_mut(new_parent)?.folded = false;
            Ok(Outcome::Demoted)
        }

        /// New item at the front of the top-level list, or, for a directory
        /// load, at the front of the file owning `selected` (the first file
        /// when nothing is selected).
        pub fn capture(
            &mut self,
            title: &str,
            state: Option<&str>,
            selected: Option<ItemId>,
        ) -> Result<(ItemId, Outcome), EditError> {
            let title = single_line_title(title)?;
            let mut item = Item::new(1, title);
            item.state = state.map(str::to_string);

            if !self.is_multi_document() {
                let id = self.insert_item(None, 0, item)?;
                return Ok((id, Outcome::Captured { file: None }));
            }

            let wrapper = match selected {
                Some(selected) => self.file_wrapper_of(selected),
                None => self.roots().first().copied(),
            }
            .ok_or(EditError::NoFileWrapper)?;
            let wrapper_item = self.item_mut(wrapper)?;
            wrapper_item.folded = false;
            item.level = wrapper_item.level + 1;
            item.source_file = wrapper_item.source_file.clone();
            let file = wrapper_item.title.clone();
            let id = self.insert_item(Some(wrapper), 0, item)?;
            Ok((id, Outcome::Captured { file: Some(file) }))
        }

        pub fn add_sub_item(
            &mut self,
            parent: ItemId,
            title: &str,
            state: Option<&str>,
        ) -> Result<(ItemId, Outcome), EditError> {
            let title = single_line_title(title)?;
            let parent_item = self.item_mut(parent)?;
            parent_item.folded = false;
            let mut item = Item::new(parent_item.level + 1, title);
            item.state = state.map(str::to_string);
            item.source_file = parent_item.source_file.clone();
            let id = self.push_item(Some(parent), item);
            Ok((id, Outcome::SubItemAdded))
        }

        pub fn rename(&mut self, id: ItemId, title: &str) -> Result<Outcome, EditError> {
            let title = single_line_title(title)?;
            self.item_mut(id)?.title = title;
            Ok(Outcome::Renamed)
        }

        /// `input` is colon separated; blank entries are dropped.
        pub fn set_tags(&mut self, id: ItemId, input: &str) -> Result<Outcome, EditError> {
            self.item_mut(id)?.tags = input
                .split(':')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(Tag::from)
                .collect();
            Ok(Outcome::TagsUpdated)
        }

        pub fn set_priority(
            &mut self,
            id: ItemId,
            priority: Option<Priority>,
        ) -> Result<Outcome, EditError> {
            self.item_mut(id)?.priority = priority;
            Ok(match priority {
                Some(p) => Outcome::PrioritySet(p),
                None => Outcome::PriorityCleared,
            })
        }

        /// An empty (or blank) value clears the effort.
        pub fn set_effort(&mut self, id: ItemId, effort: &str) -> Result<Outcome, EditError> {
            let (item, grammar) = self.item_and_grammar(id)?;
            let code = verbatim_lines(&item.notes, grammar);
            let is_effort = |pos: usize, line: &str| !code[pos] && content(line).effort.is_some();
            let effort = effort.trim();
            if effort.is_empty() {
                item.effort = None;
                let mut pos = 0;
                item.notes.retain(|line| {
                    let keep = !is_effort(pos, line.as_str());
                    pos += 1;
                    keep
                });
                return Ok(Outcome::EffortCleared);
            }

            item.effort = Some(effort.to_string());
            let line = format!(":EFFORT: {effort}");
            let notes = &item.notes;
            let found = (0..notes.len()).find(|&pos| is_effort(pos, notes[pos].as_str()));
            if let Some(pos) = found {
                let indent = indent_of(&item.notes[pos]).to_string();
                item.notes[pos] = format!("{indent}{line}");
            } else if let Some(pos) = (0..notes.len())
                .find(|&pos| !code[pos] && notes[pos].contains(":PROPERTIES:"))
            {
                let indent = indent_of(&item.notes[pos]).to_string();
                item.notes.insert(pos + 1, format!("{indent}{line}"));
            }
            Ok(Outcome::EffortSet)
        }

        pub fn set_deadline(&mut self, id: ItemId, deadline: Option<Timestamp>) -> Result<Outcome, EditError> {
            let (item, grammar) = self.item_and_grammar(id)?;
            item.deadline = deadline;
            sync_planning(&mut item.notes, grammar, "DEADLINE:", deadline);
            Ok(match deadline {
                Some(_) => Outcome::DeadlineSet,
                None => Outcome::DeadlineCleared,
            })
        }

        pub fn set_scheduled(&mut self, id: ItemId, scheduled: Option<Timestamp>) -> Result<Outcome, EditError> {
            let (item, grammar) = self.item_and_grammar(id)?;
            item.scheduled = scheduled;
            sync_planning(&mut item.notes, grammar, "SCHEDULED:", scheduled);
            Ok(match scheduled {
                Some(_) => Outcome::ScheduledSet,
                None => Outcome::ScheduledCleared,
            })
        }

        /// Typed deadline entry; see `parse_date_input`. Blank input clears.
        pub fn set_deadline_from_input(
            &mut self,
            id: ItemId,
            input: &str,
            today: NaiveDate,
        ) -> Result<Outcome, EditError> {
            let input = input.trim();
            if input.is_empty() {
                return self.set_deadline(id, None);
            }
            let date = parse_date_input(input, today)?;
            self.set_deadline(id, Some(Timestamp::on(date)))
        }

        /// Replaces the body text and re-derives the planning, effort and clock
        /// fields from it.
        pub fn set_notes(&mut self, id: ItemId, text: &str) -> Result<Outcome, EditError> {
            let (item, grammar) = self.item_and_grammar(id)?;
            if item.is_file_wrapper() {
                return Err(EditError::FileWrapper);
            }
            let notes: Vec<String> = text.lines().map(str::to_string).collect();
            let code = verbatim_lines(&notes, grammar);

            // fields without a literal line were synthesized and survive
            if item.has_note_containing("SCHEDULED:") {
                item.scheduled = None;
            }
            if item.has_note_containing("DEADLINE:") {
                item.deadline = None;
            }
            if item.has_note_containing("CLOSED:") {
                item.closed = None;
            }
            if item.has_note_containing(":PROPERTIES:") {
                item.effort = None;
            }
            if item.has_note_containing(":LOGBOOK:") {
                item.clock.clear();
            }
            for (line, verbatim) in notes.iter().zip(code) {
                if !verbatim {
                    apply_fields(item, content(line));
                }
            }
            item.notes = notes;
            Ok(Outcome::NotesSaved)
        }
    }

    fn transition(
        item: &mut Item,
        grammar: &Grammar,
        next: Option<String>,
        states: &[String],
        now: NaiveDateTime,
    ) {
        let terminal = states.last().map(String::as_str);
        let was_terminal = terminal.is_some() && item.state.as_deref() == terminal;
        let is_terminal = terminal.is_some() && next.as_deref() == terminal;
        item.state = next;
        if was_terminal == is_terminal {
            return;
        }

        rewrite_marker(&mut item.notes, grammar, "CLOSED:", '[', ']', None);
        if is_terminal {
            item.closed = Some(now);
            if stop_clock(item, grammar, now).is_ok() {
                tracing::debug!(title = %item.title, "clocked out on terminal state");
            }
        } else {
            item.closed = None;
        }
    }

    fn stop_clock(item: &mut Item, grammar: &Grammar, now: NaiveDateTime) -> Result<(), EditError> {
        let index = item
            .clock
            .iter()
            .rposition(ClockEntry::is_running)
            .ok_or(EditError::NotClockedIn)?;
        let start = item.clock[index].start;
        item.clock[index].end = Some(now);

        let started = format_clock_stamp(&start);
        let line = format!("CLOCK: [{started}]--[{}]", format_clock_stamp(&now));
        let code = verbatim_lines(&item.notes, grammar);
        let literal = item.notes.iter().zip(&code).position(|(note, verbatim)| {
            !verbatim
                && content(note)
                    .clock
                    .is_some_and(|entry| entry.is_running() && format_clock_stamp(&entry.start) == started)
        });
        if let Some(pos) = literal {
            let indent = indent_of(&item.notes[pos]).to_string();
            item.notes[pos] = format!("{indent}{line}");
        } else if let Some(drawer) = logbook_line(item, grammar) {
            let indent = indent_of(&item.notes[drawer]).to_string();
            item.notes.insert(drawer + 1, format!("{indent}{line}"));
        }
        Ok(())
    }

    fn sync_planning(notes: &mut Vec<String>, grammar: &Grammar, key: &str, stamp: Option<Timestamp>) {
        let replacement = stamp.map(|stamp| format!("{key} <{}>", format_org_date(&stamp)));
        rewrite_marker(notes, grammar, key, '<', '>', replacement.as_deref());
    }

    /// Rewrites every `KEY <...>` segment in `notes` to `replacement`, or
    /// removes it when `replacement` is none. Lines that start with `KEY` but
    /// do not parse are replaced (or dropped) whole; lines left blank go.
    /// Code blocks are never touched.
    fn rewrite_marker(
        notes: &mut Vec<String>,
        grammar: &Grammar,
        key: &str,
        open: char,
        close: char,
        replacement: Option<&str>,
    ) {
        let mut code = verbatim_lines(notes.as_slice(), grammar).into_iter();
        notes.retain_mut(|line| {
            if code.next().unwrap_or(false) {
                return true;
            }
            let span = find_marker(line, key, open, close).map(|marker| marker.span);
            match (span, replacement) {
                (Some(span), Some(text)) => {
                    line.replace_range(span, text);
                    true
                }
                (Some(span), None) => {
                    let gap = line[span.end..].len() - line[span.end..].trim_start().len();
                    line.replace_range(span.start..span.end + gap, "");
                    let trimmed = line.trim_end().len();
                    line.truncate(trimmed);
                    !line.trim().is_empty()
                }
                (None, _) if !line.trim_start().starts_with(key) => true,
                (None, Some(text)) => {
                    let indent = indent_of(line).to_string();
                    *line = format!("{indent}{text}");
                    true
                }
                (None, None) => false,
            }
        });
    }

    fn logbook_line(item: &Item, grammar: &Grammar) -> Option<usize> {
        let code = verbatim_lines(&item.notes, grammar);
        item.notes
            .iter()
            .zip(code)
            .position(|(line, verbatim)| !verbatim && line.contains(":LOGBOOK:"))
    }

    /// Titles are one line: line breaks fold to spaces.
    fn single_line_title(title: &str) -> Result<String, EditError> {
        let title = title
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if title.is_empty() {
            return Err(EditError::EmptyTitle);
        }
        Ok(title)
    }

    fn position(list: &[ItemId], id: ItemId) -> Result<usize, EditError> {
        list.iter()
            .position(|sibling| *sibling == id)
            .ok_or(EditError::UnknownItem)
    }

    fn indent_of(line: &str) -> &str {
        &line[..line.len() - line.trim_start().len()]
    }

}

pub mod format {
    use crate::classify::{Grammar, content};
    use crate::core::{ClockEntry, Item, ItemId, Outline};
    use crate::parser::verbatim_lines;
    use crate::timestamp::{format_clock_stamp, format_org_date};
    use indexmap::IndexMap;
    use std::path::PathBuf;

    /// Renders the whole tree as one document.
    pub fn format_outline(outline: &Outline, grammar: &Grammar) -> String {
        let mut buf = String::new();
        for id in outline.roots() {
            format_item(&mut buf, outline, *id, 0, grammar);
        }
        buf
    }

    /// One text per source file for a directory load: each wrapper's children,
    /// one level up. Wrappers sharing a file are merged in order.
    pub fn format_by_source(outline: &Outline, grammar: &Grammar) -> IndexMap<PathBuf, String> {
        let mut groups: IndexMap<PathBuf, Vec<ItemId>> = IndexMap::new();
        for id in outline.roots() {
            let Some(wrapper) = outline.get(*id) else {
                continue;
            };
            let Some(file) = &wrapper.source_file else {
                tracing::warn!(title = %wrapper.title, "top-level item without a file, not saved");
                continue;
            };
            groups
                .entry(file.clone())
                .or_default()
                .extend(wrapper.children().iter().copied());
        }
        groups
            .into_iter()
            .map(|(file, ids)| {
                let mut buf = String::new();
                for id in ids {
                    format_item(&mut buf, outline, id, -1, grammar);
                }
                (file, buf)
            })
            .collect()
    }

    fn format_item(buf: &mut String, outline: &Outline, id: ItemId, shift: isize, grammar: &Grammar) {
        let Some(item) = outline.get(id) else {
            return;
        };
        let level = item.level.saturating_add_signed(shift).max(1);
        buf.push_str(&render_heading(item, level, grammar.marker));
        render_synthesized(buf, item, grammar);
        for note in &item.notes {
            buf.push_str(note);
            buf.push('\n');
        }
        for child in item.children() {
            format_item(buf, outline, *child, shift, grammar);
        }
    }

    pub fn render_heading(item: &Item, level: usize, marker: char) -> String {
        let mut buf = String::new();
        buf.extend(std::iter::repeat_n(marker, level));
        if let Some(state) = &item.state {
            buf.push(' ');
            buf.push_str(state);
        }
        if let Some(priority) = item.priority {
            buf.push_str(&format!(" [#{priority}]"));
        }
        buf.push(' ');
        buf.push_str(&item.title);
        if !item.tags.is_empty() {
            buf.push_str(" :");
            for tag in &item.tags {
                buf.push_str(&tag.0);
                buf.push(':');
            }
        }
        buf.push('\n');
        buf
    }

    /// Lines for structured fields that have no literal counterpart in the
    /// notes. Code blocks do not count as literals.
    fn render_synthesized(buf: &mut String, item: &Item, grammar: &Grammar) {
        let code = verbatim_lines(&item.notes, grammar);
        let has_literal = |needle: &str| {
            item.notes
                .iter()
                .zip(&code)
                .any(|(line, verbatim)| !verbatim && line.contains(needle))
        };
        if let Some(stamp) = &item.scheduled {
            if !has_literal("SCHEDULED:") {
                buf.push_str(&format!("SCHEDULED: <{}>\n", format_org_date(stamp)));
            }
        }
        if let Some(stamp) = &item.deadline {
            if !has_literal("DEADLINE:") {
                buf.push_str(&format!("DEADLINE: <{}>\n", format_org_date(stamp)));
            }
        }
        if let Some(at) = &item.closed {
            if !has_literal("CLOSED:") {
                buf.push_str(&format!("CLOSED: [{}]\n", format_clock_stamp(at)));
            }
        }
        if let Some(effort) = &item.effort {
            if !has_literal(":PROPERTIES:") {
                buf.push_str(":PROPERTIES:\n");
                buf.push_str(&format!(":EFFORT: {effort}\n"));
                buf.push_str(":END:\n");
            }
        }
        let unlogged = unlogged_clock_entries(item, &code);
        if !unlogged.is_empty() {
            buf.push_str(":LOGBOOK:\n");
            for entry in unlogged {
                buf.push_str("CLOCK: [");
                buf.push_str(&format_clock_stamp(&entry.start));
                buf.push(']');
                if let Some(end) = &entry.end {
                    buf.push_str("--[");
                    buf.push_str(&format_clock_stamp(end));
                    buf.push(']');
                }
                buf.push('\n');
            }
            buf.push_str(":END:\n");
        }
    }

    /// Clock entries with no `CLOCK:` line of their own in the notes, wherever
    /// that line sits. Stamps compare as written, to the minute.
    fn unlogged_clock_entries<'a>(item: &'a Item, code: &[bool]) -> Vec<&'a ClockEntry> {
        let key = |entry: &ClockEntry| {
            (
                format_clock_stamp(&entry.start),
                entry.end.as_ref().map(format_clock_stamp),
            )
        };
        let mut logged: Vec<_> = item
            .notes
            .iter()
            .zip(code)
            .filter(|(_, verbatim)| !**verbatim)
            .filter_map(|(line, _)| content(line).clock)
            .map(|entry| key(&entry))
            .collect();
        item.clock
            .iter()
            .filter(|entry| match logged.iter().position(|k| *k == key(*entry)) {
                Some(pos) => {
                    logged.swap_remove(pos);
                    false
                }
                None => true,
            })
            .collect()
    }

}

pub mod storage {
    //! Filesystem persistence. Loading a single missing file gives an empty
    //! outline; a directory load wraps each `*.org` file under its own item.

    use crate::classify::Grammar;
    use crate::core::Outline;
    use crate::format::{format_by_source, format_outline};
    use crate::parser::parse_outline;
    use std::{
        fs, io,
        path::{Path, PathBuf},
    };

    #[derive(Debug, thiserror::Error)]
    pub enum OutlineError {
        #[error("failed to read {path:?}")]
        Read {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("failed to list {path:?}")]
        ListDir {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("failed to write {path:?}")]
        Write {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
    }

    pub trait OutlineStore {
        fn load(&self, path: &Path) -> Result<Outline, OutlineError>;
        fn load_dir(&self, dir: &Path) -> Result<Outline, OutlineError>;
        fn save(&self, outline: &Outline) -> Result<(), OutlineError>;
    }

    #[derive(Debug, Clone, Default)]
    pub struct FsStore {
        grammar: Grammar,
    }

    impl FsStore {
        pub fn new(grammar: Grammar) -> Self {
            Self { grammar }
        }

        pub fn grammar(&self) -> &Grammar {
            &self.grammar
        }

        /// The files `save` would write, with their full text.
        pub fn render(&self, outline: &Outline) -> Vec<(PathBuf, String)> {
            if outline.is_multi_document() {
                format_by_source(outline, &self.grammar).into_iter().collect()
            } else {
                vec![(outline.path.clone(), format_outline(outline, &self.grammar))]
            }
        }
    }

    impl OutlineStore for FsStore {
        fn load(&self, path: &Path) -> Result<Outline, OutlineError> {
            match fs::read_to_string(path) {
                Ok(text) => {
                    let outline = parse_outline(path, &text, &self.grammar);
                    tracing::debug!(?path, items = outline.len(), "loaded outline");
                    Ok(outline)
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(?path, "no file yet, starting empty");
                    let mut outline = Outline::new(path);
                    outline.set_grammar(self.grammar.clone());
                    Ok(outline)
                }
                Err(source) => Err(OutlineError::Read {
                    path: path.to_path_buf(),
                    source,
                }),
            }
        }

        fn load_dir(&self, dir: &Path) -> Result<Outline, OutlineError> {
            let mut outline = Outline::new(dir);
            outline.set_grammar(self.grammar.clone());
            for file in org_files_in(dir)? {
                let text = match fs::read_to_string(&file) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(path = ?file, error = %err, "skipping unreadable file");
                        continue;
                    }
                };
                let document = parse_outline(&file, &text, &self.grammar);
                tracing::debug!(path = ?file, items = document.len(), "loaded outline");
                outline.wrap_document(&file, document);
            }
            Ok(outline)
        }

        fn save(&self, outline: &Outline) -> Result<(), OutlineError> {
            for (path, text) in self.render(outline) {
                fs::write(&path, text).map_err(|source| OutlineError::Write {
                    path: path.clone(),
                    source,
                })?;
                tracing::info!(path = ?path, "saved outline");
            }
            Ok(())
        }
    }

    /// `*.org` regular files directly inside `dir`, sorted by name.
    fn org_files_in(dir: &Path) -> Result<Vec<PathBuf>, OutlineError> {
        let list_err = |source| OutlineError::ListDir {
            path: dir.to_path_buf(),
            source,
        };
        let mut files = Vec::new();
        for entry in fs::read_dir(dir).map_err(list_err)? {
            let path = entry.map_err(list_err)?.path();
            if path.extension().is_some_and(|ext| ext == "org") && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

}

pub mod agenda {
    //! Read-model for the agenda view: one row per SCHEDULED or DEADLINE date
    //! falling before the end of the window.

    use crate::core::{ItemId, Outline, Priority, Tag, Timestamp};
    use chrono::{Days, NaiveDate};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AgendaWhenKind {
        Scheduled,
        Deadline,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AgendaItem {
        pub item: ItemId,
        pub when_kind: AgendaWhenKind,
        pub when: Timestamp,
        pub title: String,
        pub state: Option<String>,
        pub priority: Option<Priority>,
        pub tags: Vec<Tag>,
        /// Dated before `today`.
        pub overdue: bool,
    }

    /// Rows dated before `today + days`, earliest first. There is no lower
    /// bound: anything overdue stays on the agenda.
    pub fn project(outline: &Outline, today: NaiveDate, days: u64) -> Vec<AgendaItem> {
        let horizon = today.checked_add_days(Days::new(days)).unwrap_or(NaiveDate::MAX);
        let mut rows = Vec::new();
        for id in outline.preorder() {
            let Some(item) = outline.get(id) else {
                continue;
            };
            let dates = [
                (AgendaWhenKind::Scheduled, item.scheduled),
                (AgendaWhenKind::Deadline, item.deadline),
            ];
            for (when_kind, when) in dates {
                let Some(when) = when.filter(|stamp| stamp.date < horizon) else {
                    continue;
                };
                rows.push(AgendaItem {
                    item: id,
                    when_kind,
                    when,
                    title: item.title.clone(),
                    state: item.state.clone(),
                    priority: item.priority,
                    tags: item.tags.iter().cloned().collect(),
                    overdue: when.date < today,
                });
            }
        }
        rows.sort_by_key(|row| row.when);
        rows
    }

}
