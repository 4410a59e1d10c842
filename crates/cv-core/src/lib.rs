//! Core entities, validation rules, and traits for CineVault.
//!
//! Entities validate themselves on construction and on every setter call.
//! Each check returns the first violated rule, evaluated in the order
//! mandatory, range, interval, uniqueness/referential, frozen.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Identifier of a person record.
pub type PersonId = u32;

/// Identifier of a movie record.
pub type MovieId = u32;

/// Maximum length, in characters, of names and titles.
pub const MAX_TEXT_LENGTH: usize = 120;

/// Largest accepted record id, leaving room for the next-id counter.
pub const MAX_ID: u32 = u32::MAX - 1;

/// Date format used for release dates, both in slots and in stored records.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// The date of the first public film screening; no release date may precede it.
pub fn earliest_release_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1895, 12, 28).expect("1895-12-28 is a valid calendar date")
}

/// The reason a value was rejected.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConstraintViolation {
    /// A required value is missing or blank.
    #[error("{0}")]
    Mandatory(String),
    /// The value has the wrong shape or lies outside the value domain.
    #[error("{0}")]
    Range(String),
    /// The value lies outside an allowed length, number, or date interval.
    #[error("{0}")]
    Interval(String),
    /// The id collides with an existing record.
    #[error("{0}")]
    Uniqueness(String),
    /// The referenced record does not exist.
    #[error("{0}")]
    ReferentialIntegrity(String),
    /// The field has already been set and cannot change.
    #[error("{0}")]
    FrozenValue(String),
}

impl ConstraintViolation {
    /// Stable name of the violation kind, used in log output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mandatory(_) => "MandatoryValueConstraintViolation",
            Self::Range(_) => "RangeConstraintViolation",
            Self::Interval(_) => "IntervalConstraintViolation",
            Self::Uniqueness(_) => "UniquenessConstraintViolation",
            Self::ReferentialIntegrity(_) => "ReferentialIntegrityConstraintViolation",
            Self::FrozenValue(_) => "FrozenValueConstraintViolation",
        }
    }
}

/// Outcome of a check; `Ok` means no constraint was violated.
pub type Validation<T = ()> = Result<T, ConstraintViolation>;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors returned by entity and repository operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Returned when a validation rule is violated.
    #[error("{}: {}", .0.kind(), .0)]
    Validation(#[from] ConstraintViolation),
    /// Returned when an update or delete names an unknown record.
    #[error("{collection} record {id} not found")]
    NotFound {
        /// Collection that was searched.
        collection: &'static str,
        /// The missing id.
        id: u32,
    },
    /// Returned when reading or writing the persistent store fails.
    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// The underlying violation, if this error is a validation failure.
    pub fn violation(&self) -> Option<&ConstraintViolation> {
        match self {
            Self::Validation(violation) => Some(violation),
            _ => None,
        }
    }
}

/// A labelled integer enumeration with 1-based indices.
pub trait Enumeration: Copy + Eq + 'static {
    /// Human-readable name of the enumeration, used in messages.
    const NAME: &'static str;
    /// Every value, ordered by index.
    const ALL: &'static [Self];

    /// The 1-based index of the value.
    fn index(self) -> i64;

    /// The display label of the value.
    fn label(self) -> &'static str;

    /// Look up a value by index.
    fn from_index(index: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|value| value.index() == index)
    }

    /// Validate an index, returning the matching value.
    fn check_index(index: i64) -> Validation<Self> {
        Self::from_index(index).ok_or_else(|| {
            ConstraintViolation::Range(format!(
                "the {} must be an integer between 1 and {}, not {index}",
                Self::NAME,
                Self::ALL.len()
            ))
        })
    }
}

/// Roles a person can take; maintained by the movie and person collections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PersonCategory {
    /// Directs at least one movie.
    Director,
    /// Plays in at least one movie.
    Actor,
    /// Acts as the agent of at least one person.
    Agent,
}

impl Enumeration for PersonCategory {
    const NAME: &'static str = "person category";
    const ALL: &'static [Self] = &[Self::Director, Self::Actor, Self::Agent];

    fn index(self) -> i64 {
        match self {
            Self::Director => 1,
            Self::Actor => 2,
            Self::Agent => 3,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Director => "Director",
            Self::Actor => "Actor",
            Self::Agent => "Agent",
        }
    }
}

/// Special kinds of movie that carry extra fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MovieCategory {
    /// A movie about a person; requires `about`.
    Biography,
    /// An episode of a TV series; requires `tv_series_name` and `episode_no`.
    TvSeriesEpisode,
}

impl Enumeration for MovieCategory {
    const NAME: &'static str = "movie category";
    const ALL: &'static [Self] = &[Self::Biography, Self::TvSeriesEpisode];

    fn index(self) -> i64 {
        match self {
            Self::Biography => 1,
            Self::TvSeriesEpisode => 2,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Biography => "Biography",
            Self::TvSeriesEpisode => "TV series episode",
        }
    }
}

/// A reference to a person given either as a raw id or as a person value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersonRef {
    /// A raw, not yet validated id.
    Id(i64),
    /// An already-resolved person.
    Entity(Box<Person>),
}

impl PersonRef {
    /// Normalize the reference to the raw id it names.
    pub fn raw_id(&self) -> i64 {
        match self {
            Self::Id(id) => *id,
            Self::Entity(person) => i64::from(person.person_id),
        }
    }
}

impl From<i64> for PersonRef {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl From<&Person> for PersonRef {
    fn from(person: &Person) -> Self {
        Self::Entity(Box::new(person.clone()))
    }
}

/// A multi-valued person reference, given as a list or as an id-keyed map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersonRefs {
    /// References in list form.
    List(Vec<PersonRef>),
    /// References keyed by their id string; keys are not trusted.
    Keyed(BTreeMap<String, PersonRef>),
}

impl Default for PersonRefs {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl PersonRefs {
    /// Normalize to raw ids, dropping duplicates and keeping first-seen order.
    pub fn raw_ids(&self) -> Vec<i64> {
        let mut seen = BTreeSet::new();
        let refs: Box<dyn Iterator<Item = &PersonRef>> = match self {
            Self::List(refs) => Box::new(refs.iter()),
            Self::Keyed(refs) => Box::new(refs.values()),
        };
        refs.map(PersonRef::raw_id)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// True when no references are given.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::List(refs) => refs.is_empty(),
            Self::Keyed(refs) => refs.is_empty(),
        }
    }
}

impl From<Vec<i64>> for PersonRefs {
    fn from(ids: Vec<i64>) -> Self {
        Self::List(ids.into_iter().map(PersonRef::Id).collect())
    }
}

impl From<Vec<PersonRef>> for PersonRefs {
    fn from(refs: Vec<PersonRef>) -> Self {
        Self::List(refs)
    }
}

impl From<BTreeMap<String, PersonRef>> for PersonRefs {
    fn from(refs: BTreeMap<String, PersonRef>) -> Self {
        Self::Keyed(refs)
    }
}

/// A partial update to an optional field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Change<T> {
    /// Leave the field as it is.
    #[default]
    Keep,
    /// Remove the current value.
    Clear,
    /// Replace the current value.
    Set(T),
}

/// Read access to the live person collection.
pub trait PersonDirectory {
    /// Look up a person by id.
    fn person(&self, id: PersonId) -> Option<&Person>;

    /// True when a person with this id exists.
    fn contains_person(&self, id: PersonId) -> bool {
        self.person(id).is_some()
    }
}

impl PersonDirectory for BTreeMap<PersonId, Person> {
    fn person(&self, id: PersonId) -> Option<&Person> {
        self.get(&id)
    }
}

/// Read access to the live movie collection.
pub trait MovieDirectory {
    /// True when a movie with this id exists.
    fn contains_movie(&self, id: MovieId) -> bool;
}

impl MovieDirectory for BTreeMap<MovieId, Movie> {
    fn contains_movie(&self, id: MovieId) -> bool {
        self.contains_key(&id)
    }
}

/// Persistent key-value storage holding one text value per key.
pub trait KeyValueStore {
    /// Read the value stored under `key`, if any.
    fn get_item(&self, key: &str) -> CoreResult<Option<String>>;
    /// Replace the value stored under `key`.
    fn set_item(&mut self, key: &str, value: &str) -> CoreResult<()>;
    /// Remove the value stored under `key`; missing keys are ignored.
    fn remove_item(&mut self, key: &str) -> CoreResult<()>;
}

/// Parse user-entered text as an integer for the named field.
pub fn parse_integer(field: &str, text: &str) -> Validation<i64> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ConstraintViolation::Mandatory(format!(
            "a value for the {field} must be provided"
        )));
    }
    text.parse().map_err(|_| {
        ConstraintViolation::Range(format!("the {field} must be an integer, not {text:?}"))
    })
}

fn check_text(field: &str, value: Option<&str>) -> Validation<String> {
    let value = value.map(str::trim).unwrap_or_default();
    if value.is_empty() {
        return Err(ConstraintViolation::Mandatory(format!(
            "a {field} must be provided"
        )));
    }
    if value.chars().count() > MAX_TEXT_LENGTH {
        return Err(ConstraintViolation::Interval(format!(
            "the {field} must have at most {MAX_TEXT_LENGTH} characters"
        )));
    }
    Ok(value.to_string())
}

fn check_positive_id(field: &str, id: Option<i64>) -> Validation<u32> {
    let id = id.ok_or_else(|| {
        ConstraintViolation::Mandatory(format!("a value for the {field} must be provided"))
    })?;
    let id = u32::try_from(id)
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| {
            ConstraintViolation::Range(format!("the {field} must be a positive integer, not {id}"))
        })?;
    if id > MAX_ID {
        return Err(ConstraintViolation::Interval(format!(
            "the {field} must not exceed {MAX_ID}, not {id}"
        )));
    }
    Ok(id)
}

fn resolve_person(
    role: &str,
    reference: Option<&PersonRef>,
    people: &impl PersonDirectory,
) -> Validation<PersonId> {
    let id = check_positive_id(&format!("{role} ID"), reference.map(PersonRef::raw_id))?;
    if !people.contains_person(id) {
        return Err(ConstraintViolation::ReferentialIntegrity(format!(
            "there is no person with ID {id} to serve as {role}"
        )));
    }
    Ok(id)
}

/// Field values used to create a person.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersonSlots {
    /// Requested id; assigned from the collection counter when absent.
    pub person_id: Option<i64>,
    /// Full name.
    pub name: Option<String>,
    /// Category indices.
    pub categories: Vec<i64>,
    /// The person's agent.
    pub agent: Option<PersonRef>,
}

/// Field changes applied to an existing person.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersonUpdate {
    /// Id of the person to update.
    pub person_id: i64,
    /// New name, if it changes.
    pub name: Option<String>,
    /// Agent change.
    pub agent: Change<PersonRef>,
}

/// A person who directs, plays in, or is the subject of movies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Person {
    person_id: PersonId,
    name: String,
    categories: BTreeSet<PersonCategory>,
    agent: Option<PersonId>,
    directed_movies: BTreeSet<MovieId>,
    played_movies: BTreeSet<MovieId>,
}

impl Person {
    /// Check the shape of a person id.
    pub fn check_person_id(id: Option<i64>) -> Validation<PersonId> {
        check_positive_id("person ID", id)
    }

    /// Check a person id for use as the id of a new person.
    pub fn check_person_id_as_id(
        id: Option<i64>,
        people: &impl PersonDirectory,
    ) -> Validation<PersonId> {
        let id = Self::check_person_id(id)?;
        if people.contains_person(id) {
            return Err(ConstraintViolation::Uniqueness(format!(
                "there is already a person record with ID {id}"
            )));
        }
        Ok(id)
    }

    /// Check a person id used to reference an existing person.
    pub fn check_person_id_as_id_ref(
        id: Option<i64>,
        people: &impl PersonDirectory,
    ) -> Validation<PersonId> {
        let id = Self::check_person_id(id)?;
        if !people.contains_person(id) {
            return Err(ConstraintViolation::ReferentialIntegrity(format!(
                "there is no person record with ID {id}"
            )));
        }
        Ok(id)
    }

    /// Check a name.
    pub fn check_name(name: Option<&str>) -> Validation<String> {
        check_text("name", name)
    }

    /// Check a category index.
    pub fn check_category(index: i64) -> Validation<PersonCategory> {
        PersonCategory::check_index(index)
    }

    /// Check an agent reference for the person with id `own_id`.
    pub fn check_agent(
        agent: Option<&PersonRef>,
        own_id: PersonId,
        people: &impl PersonDirectory,
    ) -> Validation<Option<PersonId>> {
        let Some(agent) = agent else {
            return Ok(None);
        };
        if agent.raw_id() == i64::from(own_id) {
            return Err(ConstraintViolation::Range(format!(
                "person {own_id} cannot be their own agent"
            )));
        }
        resolve_person("agent", Some(agent), people).map(Some)
    }

    /// Create a person, validating every field.
    pub fn new(slots: PersonSlots, people: &impl PersonDirectory) -> Validation<Self> {
        let person_id = Self::check_person_id_as_id(slots.person_id, people)?;
        let name = Self::check_name(slots.name.as_deref())?;
        let categories = slots
            .categories
            .into_iter()
            .map(Self::check_category)
            .collect::<Validation<BTreeSet<_>>>()?;
        let agent = Self::check_agent(slots.agent.as_ref(), person_id, people)?;
        Ok(Self {
            person_id,
            name,
            categories,
            agent,
            directed_movies: BTreeSet::new(),
            played_movies: BTreeSet::new(),
        })
    }

    /// The person id.
    pub fn person_id(&self) -> PersonId {
        self.person_id
    }

    /// The person's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The person's categories.
    pub fn categories(&self) -> &BTreeSet<PersonCategory> {
        &self.categories
    }

    /// True if the person carries `category`.
    pub fn has_category(&self, category: PersonCategory) -> bool {
        self.categories.contains(&category)
    }

    /// The id of the person's agent.
    pub fn agent(&self) -> Option<PersonId> {
        self.agent
    }

    /// Movies this person directs.
    pub fn directed_movies(&self) -> &BTreeSet<MovieId> {
        &self.directed_movies
    }

    /// Movies this person plays in.
    pub fn played_movies(&self) -> &BTreeSet<MovieId> {
        &self.played_movies
    }

    /// Replace the name.
    pub fn set_name(&mut self, name: &str) -> Validation {
        self.name = Self::check_name(Some(name))?;
        Ok(())
    }

    /// Replace or clear the agent.
    pub fn set_agent(
        &mut self,
        agent: Option<&PersonRef>,
        people: &impl PersonDirectory,
    ) -> Validation {
        self.agent = Self::check_agent(agent, self.person_id, people)?;
        Ok(())
    }

    /// Drop the agent reference without validation.
    pub fn clear_agent(&mut self) {
        self.agent = None;
    }

    /// Add a category by index; adding twice has no effect.
    pub fn add_category(&mut self, index: i64) -> Validation {
        let category = Self::check_category(index)?;
        self.categories.insert(category);
        Ok(())
    }

    /// Remove a category by index; removing an absent category has no effect.
    pub fn remove_category(&mut self, index: i64) -> Validation {
        let category = Self::check_category(index)?;
        self.categories.remove(&category);
        Ok(())
    }

    /// Add a category known to be valid.
    pub fn tag(&mut self, category: PersonCategory) {
        self.categories.insert(category);
    }

    /// Remove a category known to be valid.
    pub fn untag(&mut self, category: PersonCategory) {
        self.categories.remove(&category);
    }

    /// Record that this person directs `movie_id`.
    pub fn link_directed(&mut self, movie_id: MovieId) {
        self.directed_movies.insert(movie_id);
    }

    /// Forget that this person directs `movie_id`.
    pub fn unlink_directed(&mut self, movie_id: MovieId) {
        self.directed_movies.remove(&movie_id);
    }

    /// Record that this person plays in `movie_id`.
    pub fn link_played(&mut self, movie_id: MovieId) {
        self.played_movies.insert(movie_id);
    }

    /// Forget that this person plays in `movie_id`.
    pub fn unlink_played(&mut self, movie_id: MovieId) {
        self.played_movies.remove(&movie_id);
    }

    /// Drop all movie backlinks.
    pub fn clear_backlinks(&mut self) {
        self.directed_movies.clear();
        self.played_movies.clear();
    }

    /// Convert to the stored record shape.
    pub fn to_record(&self) -> PersonRecord {
        PersonRecord {
            person_id: i64::from(self.person_id),
            name: self.name.clone(),
            categories: self.categories.iter().map(|c| c.index()).collect(),
            agent: self.agent.map(i64::from),
        }
    }

    /// Rebuild a person from a stored record.
    ///
    /// The agent id is only shape-checked here: the agent's record may not
    /// have been loaded yet, so the collection resolves it in a second pass.
    /// Invalid records are logged and yield `None`.
    pub fn from_record(record: PersonRecord) -> Option<Self> {
        let raw_id = record.person_id;
        let result = (|| -> Validation<Self> {
            let slots = PersonSlots {
                person_id: Some(record.person_id),
                name: Some(record.name),
                categories: record.categories,
                agent: None,
            };
            let mut person = Self::new(slots, &BTreeMap::<PersonId, Person>::new())?;
            if let Some(agent) = record.agent {
                let agent = check_positive_id("agent ID", Some(agent))?;
                if agent == person.person_id {
                    return Err(ConstraintViolation::Range(format!(
                        "person {agent} cannot be their own agent"
                    )));
                }
                person.agent = Some(agent);
            }
            Ok(person)
        })();
        match result {
            Ok(person) => Some(person),
            Err(violation) => {
                warn!(
                    person_id = raw_id,
                    kind = violation.kind(),
                    "skipping invalid person record: {violation}"
                );
                None
            }
        }
    }
}

impl fmt::Display for Person {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.person_id, self.name)?;
        if !self.categories.is_empty() {
            let labels: Vec<_> = self.categories.iter().map(|c| c.label()).collect();
            write!(f, " [{}]", labels.join(", "))?;
        }
        if let Some(agent) = self.agent {
            write!(f, " (agent {agent})")?;
        }
        Ok(())
    }
}

/// Stored form of a person.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersonRecord {
    /// Person id.
    pub person_id: i64,
    /// Name.
    pub name: String,
    /// Category indices.
    #[serde(default)]
    pub categories: Vec<i64>,
    /// Agent id, `null` when unset.
    #[serde(default)]
    pub agent: Option<i64>,
}

/// Validation settings for movies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MovieRules {
    /// Reject movies without a release date.
    pub release_date_required: bool,
}

/// Field values used to create a movie.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MovieSlots {
    /// Requested id; assigned from the collection counter when absent.
    pub movie_id: Option<i64>,
    /// Title.
    pub title: Option<String>,
    /// Release date as `YYYY-MM-DD`.
    pub release_date: Option<String>,
    /// The director.
    pub director: Option<PersonRef>,
    /// Actors.
    pub actors: PersonRefs,
    /// Movie category index.
    pub category: Option<i64>,
    /// Biography subject.
    pub about: Option<PersonRef>,
    /// Series name for TV series episodes.
    pub tv_series_name: Option<String>,
    /// Episode number for TV series episodes.
    pub episode_no: Option<i64>,
}

/// Field changes applied to an existing movie.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MovieUpdate {
    /// Id of the movie to update.
    pub movie_id: i64,
    /// New title, if it changes.
    pub title: Option<String>,
    /// Release date change.
    pub release_date: Change<String>,
    /// New director, if it changes.
    pub director: Option<PersonRef>,
    /// Actors to add.
    pub actors_to_add: PersonRefs,
    /// Actors to remove.
    pub actors_to_remove: PersonRefs,
    /// Category change; only the first assignment sticks.
    pub category: Change<i64>,
    /// Biography subject change.
    pub about: Change<PersonRef>,
    /// Series name change.
    pub tv_series_name: Change<String>,
    /// Episode number change.
    pub episode_no: Change<i64>,
}

/// A movie with its director and cast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Movie {
    movie_id: MovieId,
    title: String,
    release_date: Option<NaiveDate>,
    director: PersonId,
    actors: BTreeSet<PersonId>,
    category: Option<MovieCategory>,
    about: Option<PersonId>,
    tv_series_name: Option<String>,
    episode_no: Option<u32>,
}

impl Movie {
    /// Check the shape of a movie id.
    pub fn check_movie_id(id: Option<i64>) -> Validation<MovieId> {
        check_positive_id("movie ID", id)
    }

    /// Check a movie id for use as the id of a new movie.
    pub fn check_movie_id_as_id(
        id: Option<i64>,
        movies: &impl MovieDirectory,
    ) -> Validation<MovieId> {
        let id = Self::check_movie_id(id)?;
        if movies.contains_movie(id) {
            return Err(ConstraintViolation::Uniqueness(format!(
                "there is already a movie record with ID {id}"
            )));
        }
        Ok(id)
    }

    /// Check a movie id used to reference an existing movie.
    pub fn check_movie_id_as_id_ref(
        id: Option<i64>,
        movies: &impl MovieDirectory,
    ) -> Validation<MovieId> {
        let id = Self::check_movie_id(id)?;
        if !movies.contains_movie(id) {
            return Err(ConstraintViolation::ReferentialIntegrity(format!(
                "there is no movie record with ID {id}"
            )));
        }
        Ok(id)
    }

    /// Check a title.
    pub fn check_title(title: Option<&str>) -> Validation<String> {
        check_text("title", title)
    }

    /// Check a release date given as `YYYY-MM-DD`.
    pub fn check_release_date(
        date: Option<&str>,
        rules: &MovieRules,
    ) -> Validation<Option<NaiveDate>> {
        let date = date.map(str::trim).filter(|date| !date.is_empty());
        let Some(date) = date else {
            if rules.release_date_required {
                return Err(ConstraintViolation::Mandatory(
                    "a release date must be provided".into(),
                ));
            }
            return Ok(None);
        };
        let parsed = NaiveDate::parse_from_str(date, DATE_FORMAT).map_err(|_| {
            ConstraintViolation::Range(format!(
                "the release date must be a valid YYYY-MM-DD date, not {date:?}"
            ))
        })?;
        if parsed < earliest_release_date() {
            return Err(ConstraintViolation::Interval(format!(
                "the release date must not be before {}",
                earliest_release_date()
            )));
        }
        Ok(Some(parsed))
    }

    /// Check a director reference.
    pub fn check_director(
        director: Option<&PersonRef>,
        people: &impl PersonDirectory,
    ) -> Validation<PersonId> {
        resolve_person("director", director, people)
    }

    /// Check an actor reference.
    pub fn check_actor(actor: &PersonRef, people: &impl PersonDirectory) -> Validation<PersonId> {
        resolve_person("actor", Some(actor), people)
    }

    /// Check a category index.
    pub fn check_category(index: Option<i64>) -> Validation<Option<MovieCategory>> {
        index.map(MovieCategory::check_index).transpose()
    }

    /// Check a biography subject against the movie category.
    pub fn check_about(
        about: Option<&PersonRef>,
        category: Option<MovieCategory>,
        people: &impl PersonDirectory,
    ) -> Validation<Option<PersonId>> {
        match (category, about) {
            (Some(MovieCategory::Biography), None) => Err(ConstraintViolation::Mandatory(
                "a biography must say who it is about".into(),
            )),
            (Some(MovieCategory::Biography), Some(about)) => {
                resolve_person("biography subject", Some(about), people).map(Some)
            }
            (_, Some(_)) => Err(ConstraintViolation::Range(
                "an about value must not be provided if the movie is not a biography".into(),
            )),
            (_, None) => Ok(None),
        }
    }

    /// Check a TV series name against the movie category.
    pub fn check_tv_series_name(
        name: Option<&str>,
        category: Option<MovieCategory>,
    ) -> Validation<Option<String>> {
        let name = name.filter(|name| !name.trim().is_empty());
        match (category, name) {
            (Some(MovieCategory::TvSeriesEpisode), name) => {
                check_text("TV series name", name).map(Some)
            }
            (_, Some(_)) => Err(ConstraintViolation::Range(
                "a TV series name must not be provided if the movie is not a TV series episode"
                    .into(),
            )),
            (_, None) => Ok(None),
        }
    }

    /// Check an episode number against the movie category.
    pub fn check_episode_no(
        episode_no: Option<i64>,
        category: Option<MovieCategory>,
    ) -> Validation<Option<u32>> {
        match (category, episode_no) {
            (Some(MovieCategory::TvSeriesEpisode), episode_no) => {
                check_positive_id("episode number", episode_no).map(Some)
            }
            (_, Some(_)) => Err(ConstraintViolation::Range(
                "an episode number must not be provided if the movie is not a TV series episode"
                    .into(),
            )),
            (_, None) => Ok(None),
        }
    }

    /// Create a movie, validating every field.
    pub fn new(
        slots: MovieSlots,
        movies: &impl MovieDirectory,
        people: &impl PersonDirectory,
        rules: &MovieRules,
    ) -> Validation<Self> {
        let movie_id = Self::check_movie_id_as_id(slots.movie_id, movies)?;
        let title = Self::check_title(slots.title.as_deref())?;
        let release_date = Self::check_release_date(slots.release_date.as_deref(), rules)?;
        let director = Self::check_director(slots.director.as_ref(), people)?;
        let actors = slots
            .actors
            .raw_ids()
            .into_iter()
            .map(|id| Self::check_actor(&PersonRef::Id(id), people))
            .collect::<Validation<BTreeSet<_>>>()?;
        let category = Self::check_category(slots.category)?;
        let about = Self::check_about(slots.about.as_ref(), category, people)?;
        let tv_series_name = Self::check_tv_series_name(slots.tv_series_name.as_deref(), category)?;
        let episode_no = Self::check_episode_no(slots.episode_no, category)?;
        Ok(Self {
            movie_id,
            title,
            release_date,
            director,
            actors,
            category,
            about,
            tv_series_name,
            episode_no,
        })
    }

    /// The movie id.
    pub fn movie_id(&self) -> MovieId {
        self.movie_id
    }

    /// The title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// The release date.
    pub fn release_date(&self) -> Option<NaiveDate> {
        self.release_date
    }

    /// The director's id.
    pub fn director(&self) -> PersonId {
        self.director
    }

    /// The actors' ids.
    pub fn actors(&self) -> &BTreeSet<PersonId> {
        &self.actors
    }

    /// The category.
    pub fn category(&self) -> Option<MovieCategory> {
        self.category
    }

    /// The biography subject's id.
    pub fn about(&self) -> Option<PersonId> {
        self.about
    }

    /// The TV series name.
    pub fn tv_series_name(&self) -> Option<&str> {
        self.tv_series_name.as_deref()
    }

    /// The episode number.
    pub fn episode_no(&self) -> Option<u32> {
        self.episode_no
    }

    /// Every person this movie references, director first.
    pub fn referenced_people(&self) -> impl Iterator<Item = PersonId> + '_ {
        std::iter::once(self.director)
            .chain(self.actors.iter().copied())
            .chain(self.about)
    }

    /// Replace the title.
    pub fn set_title(&mut self, title: &str) -> Validation {
        self.title = Self::check_title(Some(title))?;
        Ok(())
    }

    /// Replace or clear the release date.
    pub fn set_release_date(&mut self, date: Option<&str>, rules: &MovieRules) -> Validation {
        self.release_date = Self::check_release_date(date, rules)?;
        Ok(())
    }

    /// Replace the director.
    pub fn set_director(
        &mut self,
        director: &PersonRef,
        people: &impl PersonDirectory,
    ) -> Validation {
        self.director = Self::check_director(Some(director), people)?;
        Ok(())
    }

    /// Replace the whole actor set; nothing changes unless every actor validates.
    pub fn set_actors(&mut self, actors: &PersonRefs, people: &impl PersonDirectory) -> Validation {
        self.actors = actors
            .raw_ids()
            .into_iter()
            .map(|id| Self::check_actor(&PersonRef::Id(id), people))
            .collect::<Validation<BTreeSet<_>>>()?;
        Ok(())
    }

    /// Add an actor; adding an existing actor has no effect.
    pub fn add_actor(
        &mut self,
        actor: &PersonRef,
        people: &impl PersonDirectory,
    ) -> Validation<PersonId> {
        let id = Self::check_actor(actor, people)?;
        self.actors.insert(id);
        Ok(id)
    }

    /// Remove an actor; removing an absent actor has no effect.
    pub fn remove_actor(&mut self, actor: &PersonRef) -> Validation<PersonId> {
        let id = check_positive_id("actor ID", Some(actor.raw_id()))?;
        self.remove_actor_id(id);
        Ok(id)
    }

    /// Remove an actor by a known-valid id, returning whether it was present.
    pub fn remove_actor_id(&mut self, id: PersonId) -> bool {
        self.actors.remove(&id)
    }

    /// Set the category. Once set it is frozen: repeating the same value is a
    /// no-op, any other value or clearing is rejected.
    pub fn set_category(&mut self, index: Option<i64>) -> Validation {
        let category = Self::check_category(index)?;
        match (self.category, category) {
            (Some(current), Some(requested)) if current == requested => Ok(()),
            (Some(current), Some(_)) => Err(ConstraintViolation::FrozenValue(format!(
                "the movie category is frozen at {} and cannot be changed",
                current.label()
            ))),
            (Some(current), None) => Err(ConstraintViolation::FrozenValue(format!(
                "the movie category is frozen at {} and cannot be cleared",
                current.label()
            ))),
            (None, category) => {
                self.category = category;
                Ok(())
            }
        }
    }

    /// Set or clear the biography subject.
    pub fn set_about(
        &mut self,
        about: Option<&PersonRef>,
        people: &impl PersonDirectory,
    ) -> Validation {
        self.about = Self::check_about(about, self.category, people)?;
        Ok(())
    }

    /// Set or clear the TV series name.
    pub fn set_tv_series_name(&mut self, name: Option<&str>) -> Validation {
        self.tv_series_name = Self::check_tv_series_name(name, self.category)?;
        Ok(())
    }

    /// Set or clear the episode number.
    pub fn set_episode_no(&mut self, episode_no: Option<i64>) -> Validation {
        self.episode_no = Self::check_episode_no(episode_no, self.category)?;
        Ok(())
    }

    /// Check that the category-dependent fields agree with the category.
    pub fn check_category_fields(&self) -> Validation {
        let required = |present: bool, field: &str, wanted: MovieCategory| {
            let wanted_here = self.category == Some(wanted);
            match (wanted_here, present) {
                (true, false) => Err(ConstraintViolation::Mandatory(format!(
                    "a {} requires a {field}",
                    wanted.label()
                ))),
                (false, true) => Err(ConstraintViolation::Range(format!(
                    "a {field} is only allowed for a {}",
                    wanted.label()
                ))),
                _ => Ok(()),
            }
        };
        required(self.about.is_some(), "subject", MovieCategory::Biography)?;
        required(
            self.tv_series_name.is_some(),
            "TV series name",
            MovieCategory::TvSeriesEpisode,
        )?;
        required(
            self.episode_no.is_some(),
            "episode number",
            MovieCategory::TvSeriesEpisode,
        )
    }

    /// Convert to the stored record shape.
    pub fn to_record(&self) -> MovieRecord {
        MovieRecord {
            movie_id: i64::from(self.movie_id),
            title: self.title.clone(),
            release_date: self
                .release_date
                .map(|date| date.format(DATE_FORMAT).to_string()),
            director: i64::from(self.director),
            actors: self.actors.iter().copied().map(i64::from).collect(),
            category: self.category.map(MovieCategory::index),
            about: self.about.map(i64::from),
            tv_series_name: self.tv_series_name.clone(),
            episode_no: self.episode_no.map(i64::from),
        }
    }

    /// Rebuild a movie from a stored record, resolving people against
    /// `people`. Invalid records are logged and yield `None`.
    pub fn from_record(
        record: MovieRecord,
        people: &impl PersonDirectory,
        rules: &MovieRules,
    ) -> Option<Self> {
        let raw_id = record.movie_id;
        let slots = MovieSlots {
            movie_id: Some(record.movie_id),
            title: Some(record.title),
            release_date: record.release_date,
            director: Some(PersonRef::Id(record.director)),
            actors: record.actors.into(),
            category: record.category,
            about: record.about.map(PersonRef::Id),
            tv_series_name: record.tv_series_name,
            episode_no: record.episode_no,
        };
        match Self::new(slots, &BTreeMap::<MovieId, Movie>::new(), people, rules) {
            Ok(movie) => Some(movie),
            Err(violation) => {
                warn!(
                    movie_id = raw_id,
                    kind = violation.kind(),
                    "skipping invalid movie record: {violation}"
                );
                None
            }
        }
    }
}

impl fmt::Display for Movie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.movie_id, self.title)?;
        if let Some(date) = self.release_date {
            write!(f, " ({date})")?;
        }
        write!(f, " directed by {}", self.director)?;
        if !self.actors.is_empty() {
            let actors: Vec<_> = self.actors.iter().map(ToString::to_string).collect();
            write!(f, ", starring {}", actors.join(", "))?;
        }
        if let Some(about) = self.about {
            write!(f, "; biography about {about}")?;
        }
        if let (Some(series), Some(episode)) = (&self.tv_series_name, self.episode_no) {
            write!(f, "; episode {episode} of {series}")?;
        }
        Ok(())
    }
}

/// Stored form of a movie.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MovieRecord {
    /// Movie id.
    pub movie_id: i64,
    /// Title.
    pub title: String,
    /// Release date as `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    /// Director id.
    pub director: i64,
    /// Actor ids.
    #[serde(default)]
    pub actors: Vec<i64>,
    /// Category index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<i64>,
    /// Biography subject id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<i64>,
    /// Series name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tv_series_name: Option<String>,
    /// Episode number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_no: Option<i64>,
}
