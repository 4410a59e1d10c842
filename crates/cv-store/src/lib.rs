//! Repositories and persistence backends for CineVault.
//!
//! [`PersonStorage`] and [`MovieStorage`] own the canonical collections and
//! keep the references between them consistent. [`Library`] wires both to a
//! [`KeyValueStore`] and is the handle the front end works with.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use cv_core::{
    Change, ConstraintViolation, CoreError, CoreResult, KeyValueStore, Movie, MovieId,
    MovieRecord, MovieRules, MovieSlots, MovieUpdate, Person, PersonCategory, PersonId,
    PersonRecord, PersonRef, PersonSlots, PersonUpdate, Validation,
};

/// Default directory name for the store.
pub const STORE_DIR_NAME: &str = "cinevault";

/// Storage key of the person collection.
pub const PERSON_STORAGE_KEY: &str = "person";

/// Storage key of the movie collection.
pub const MOVIE_STORAGE_KEY: &str = "movies";

const CONFIG_FILE_NAME: &str = "config.yaml";

const PATH_ENV_VAR: &str = "CINEVAULT_PATH";

fn storage_error(err: impl std::fmt::Display) -> CoreError {
    CoreError::Storage(err.to_string())
}

fn rejected<T>(operation: &str, violation: ConstraintViolation) -> CoreResult<T> {
    warn!(operation, kind = violation.kind(), "{violation}");
    Err(violation.into())
}

fn not_found<T>(collection: &'static str, id: u32) -> CoreResult<T> {
    warn!(collection, id, "no such record");
    Err(CoreError::NotFound { collection, id })
}

/// Read every record stored under `key`. Records that do not deserialize
/// are logged and skipped; a missing or blank value yields `None`.
fn load_records<R: DeserializeOwned>(
    store: &impl KeyValueStore,
    key: &str,
) -> CoreResult<Option<Vec<R>>> {
    let Some(text) = store.get_item(key)? else {
        return Ok(None);
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    let raw: BTreeMap<String, Value> = serde_json::from_str(&text).map_err(storage_error)?;
    let mut records = Vec::with_capacity(raw.len());
    for (id, value) in raw {
        match serde_json::from_value(value) {
            Ok(record) => records.push(record),
            Err(err) => warn!(collection = key, id = %id, "skipping unreadable record: {err}"),
        }
    }
    Ok(Some(records))
}

fn save_records<R: Serialize>(
    store: &mut impl KeyValueStore,
    key: &str,
    records: &BTreeMap<u32, R>,
) -> CoreResult<()> {
    let text = serde_json::to_string(records).map_err(storage_error)?;
    store.set_item(key, &text)
}

/// The live person collection.
#[derive(Clone, Debug, Default)]
pub struct PersonStorage {
    instances: BTreeMap<PersonId, Person>,
    next_id: Option<PersonId>,
}

impl PersonStorage {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every live person, keyed by id.
    pub fn instances(&self) -> &BTreeMap<PersonId, Person> {
        &self.instances
    }

    /// Look up a person.
    pub fn get(&self, id: PersonId) -> Option<&Person> {
        self.instances.get(&id)
    }

    /// True when a live person has this id.
    pub fn contains(&self, id: PersonId) -> bool {
        self.instances.contains_key(&id)
    }

    /// Number of live people.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// True when the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// The id the next person gets when none is given.
    pub fn next_id(&mut self) -> PersonId {
        let instances = &self.instances;
        *self.next_id.get_or_insert_with(|| {
            instances
                .keys()
                .next_back()
                .map_or(1, |max| max.saturating_add(1))
        })
    }

    pub(crate) fn person_mut(&mut self, id: PersonId) -> Option<&mut Person> {
        self.instances.get_mut(&id)
    }

    pub(crate) fn clear_backlinks(&mut self) {
        self.instances.values_mut().for_each(Person::clear_backlinks);
    }

    /// Create a person. Nothing is inserted when validation fails.
    pub fn add(&mut self, mut slots: PersonSlots) -> CoreResult<PersonId> {
        if slots.person_id.is_none() {
            slots.person_id = Some(i64::from(self.next_id()));
        }
        let person = match Person::new(slots, &self.instances) {
            Ok(person) => person,
            Err(violation) => return rejected("add person", violation),
        };
        let id = person.person_id();
        let agent = person.agent();
        self.instances.insert(id, person);
        if let Some(agent) = agent {
            self.refresh_agent_tag(agent);
        }
        let next = self.next_id().max(id.saturating_add(1));
        self.next_id = Some(next);
        info!(person_id = id, "person added");
        Ok(id)
    }

    /// Apply changed fields to a person. Either every change is applied or,
    /// on the first violation, none is.
    pub fn update(&mut self, update: PersonUpdate) -> CoreResult<()> {
        let id = match Person::check_person_id(Some(update.person_id)) {
            Ok(id) => id,
            Err(violation) => return rejected("update person", violation),
        };
        let Some(current) = self.instances.get(&id) else {
            return not_found("person", id);
        };
        let mut working = current.clone();
        let previous_agent = working.agent();
        if let Err(violation) = apply_person_update(&mut working, &update, &self.instances) {
            return rejected("update person", violation);
        }
        let agent = working.agent();
        self.instances.insert(id, working);
        if agent != previous_agent {
            for affected in previous_agent.into_iter().chain(agent) {
                self.refresh_agent_tag(affected);
            }
        }
        info!(person_id = id, "person updated");
        Ok(())
    }

    /// Delete a person, clearing agent references to them and cascading
    /// into the movies that reference them.
    pub fn destroy(&mut self, id: PersonId, movies: &mut MovieStorage) -> CoreResult<()> {
        if !self.contains(id) {
            return not_found("person", id);
        }
        for person in self.instances.values_mut() {
            if person.agent() == Some(id) {
                person.clear_agent();
                debug!(person_id = person.person_id(), agent = id, "cleared agent reference");
            }
        }
        let deleted_movies = movies.remove_person_references(id, self);
        if let Some(person) = self.instances.remove(&id) {
            if let Some(agent) = person.agent() {
                self.refresh_agent_tag(agent);
            }
        }
        if self.instances.keys().next_back().is_none_or(|max| *max < id) {
            self.next_id = None;
        }
        info!(
            person_id = id,
            deleted_movies = deleted_movies.len(),
            "person destroyed"
        );
        Ok(())
    }

    /// Empty the collection.
    pub fn clear(&mut self) {
        self.instances.clear();
        self.next_id = None;
    }

    /// Replace the collection with the people stored under
    /// [`PERSON_STORAGE_KEY`]. A missing value leaves the collection as it is.
    ///
    /// Agent links are resolved in a second pass since an agent may be stored
    /// after the people it represents.
    pub fn retrieve_all(&mut self, store: &impl KeyValueStore) -> CoreResult<usize> {
        let Some(records) = load_records::<PersonRecord>(store, PERSON_STORAGE_KEY)? else {
            info!("no stored people");
            return Ok(0);
        };
        let mut loaded = BTreeMap::new();
        for record in records {
            if let Some(person) = Person::from_record(record) {
                let id = person.person_id();
                if loaded.insert(id, person).is_some() {
                    warn!(person_id = id, "duplicate person record replaced an earlier one");
                }
            }
        }

        let known: BTreeSet<PersonId> = loaded.keys().copied().collect();
        let mut agents = BTreeSet::new();
        for person in loaded.values_mut() {
            let Some(agent) = person.agent() else {
                continue;
            };
            if known.contains(&agent) {
                agents.insert(agent);
            } else {
                warn!(
                    person_id = person.person_id(),
                    agent, "dropping reference to missing agent"
                );
                person.clear_agent();
            }
        }
        for agent in agents {
            if let Some(person) = loaded.get_mut(&agent) {
                person.tag(PersonCategory::Agent);
            }
        }

        let count = loaded.len();
        self.instances = loaded;
        self.next_id = None;
        info!(count, "people loaded");
        Ok(count)
    }

    /// Write the whole collection under [`PERSON_STORAGE_KEY`].
    pub fn persist(&self, store: &mut impl KeyValueStore) -> CoreResult<()> {
        let records: BTreeMap<PersonId, PersonRecord> = self
            .instances
            .iter()
            .map(|(id, person)| (*id, person.to_record()))
            .collect();
        save_records(store, PERSON_STORAGE_KEY, &records)?;
        info!(count = records.len(), "people persisted");
        Ok(())
    }

    fn refresh_agent_tag(&mut self, agent_id: PersonId) {
        let represents = self
            .instances
            .values()
            .any(|person| person.agent() == Some(agent_id));
        if let Some(agent) = self.instances.get_mut(&agent_id) {
            if represents {
                agent.tag(PersonCategory::Agent);
            } else {
                agent.untag(PersonCategory::Agent);
            }
        }
    }
}

fn apply_person_update(
    person: &mut Person,
    update: &PersonUpdate,
    people: &BTreeMap<PersonId, Person>,
) -> Validation {
    if let Some(name) = update.name.as_deref() {
        if name.trim() != person.name() {
            person.set_name(name)?;
        }
    }
    match &update.agent {
        Change::Keep => {}
        Change::Clear => person.set_agent(None, people)?,
        Change::Set(agent) => {
            if person.agent().map(i64::from) != Some(agent.raw_id()) {
                person.set_agent(Some(agent), people)?;
            }
        }
    }
    Ok(())
}

/// The live movie collection.
#[derive(Clone, Debug, Default)]
pub struct MovieStorage {
    instances: BTreeMap<MovieId, Movie>,
    next_id: Option<MovieId>,
    rules: MovieRules,
}

impl MovieStorage {
    /// Create an empty collection validating with `rules`.
    pub fn new(rules: MovieRules) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    /// The validation rules in force.
    pub fn rules(&self) -> &MovieRules {
        &self.rules
    }

    /// Every live movie, keyed by id.
    pub fn instances(&self) -> &BTreeMap<MovieId, Movie> {
        &self.instances
    }

    /// Look up a movie.
    pub fn get(&self, id: MovieId) -> Option<&Movie> {
        self.instances.get(&id)
    }

    /// True when a live movie has this id.
    pub fn contains(&self, id: MovieId) -> bool {
        self.instances.contains_key(&id)
    }

    /// Number of live movies.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// True when the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// The id the next movie gets when none is given.
    pub fn next_id(&mut self) -> MovieId {
        let instances = &self.instances;
        *self.next_id.get_or_insert_with(|| {
            instances
                .keys()
                .next_back()
                .map_or(1, |max| max.saturating_add(1))
        })
    }

    /// Create a movie and tag its director and actors.
    pub fn add(
        &mut self,
        mut slots: MovieSlots,
        people: &mut PersonStorage,
    ) -> CoreResult<MovieId> {
        if slots.movie_id.is_none() {
            slots.movie_id = Some(i64::from(self.next_id()));
        }
        let movie = match Movie::new(slots, &self.instances, people.instances(), &self.rules) {
            Ok(movie) => movie,
            Err(violation) => return rejected("add movie", violation),
        };
        let id = movie.movie_id();
        link_references(people, &movie);
        self.instances.insert(id, movie);
        let next = self.next_id().max(id.saturating_add(1));
        self.next_id = Some(next);
        info!(movie_id = id, "movie added");
        Ok(id)
    }

    /// Apply changed fields to a movie. Either every change is applied or,
    /// on the first violation, none is.
    pub fn update(&mut self, update: MovieUpdate, people: &mut PersonStorage) -> CoreResult<()> {
        let id = match Movie::check_movie_id(Some(update.movie_id)) {
            Ok(id) => id,
            Err(violation) => return rejected("update movie", violation),
        };
        let Some(current) = self.instances.get(&id) else {
            return not_found("movie", id);
        };
        let mut working = current.clone();
        if let Err(violation) =
            apply_movie_update(&mut working, &update, people.instances(), &self.rules)
        {
            return rejected("update movie", violation);
        }
        if let Some(previous) = self.instances.insert(id, working) {
            unlink_references(people, &previous);
        }
        if let Some(movie) = self.instances.get(&id) {
            link_references(people, movie);
        }
        info!(movie_id = id, "movie updated");
        Ok(())
    }

    /// Delete a movie and drop tags its people no longer earn.
    pub fn destroy(&mut self, id: MovieId, people: &mut PersonStorage) -> CoreResult<()> {
        let Some(movie) = self.instances.remove(&id) else {
            return not_found("movie", id);
        };
        unlink_references(people, &movie);
        if self.instances.keys().next_back().is_none_or(|max| *max < id) {
            self.next_id = None;
        }
        info!(movie_id = id, "movie destroyed");
        Ok(())
    }

    /// Update every movie matching `predicate` with the changes produced by
    /// `make_update`. Returns the ids that were updated.
    pub fn update_all<P, F>(
        &mut self,
        predicate: P,
        make_update: F,
        people: &mut PersonStorage,
    ) -> Vec<MovieId>
    where
        P: Fn(&Movie) -> bool,
        F: Fn(&Movie) -> MovieUpdate,
    {
        let updates: Vec<(MovieId, MovieUpdate)> = self
            .instances
            .values()
            .filter(|movie| predicate(movie))
            .map(|movie| {
                let update = MovieUpdate {
                    movie_id: i64::from(movie.movie_id()),
                    ..make_update(movie)
                };
                (movie.movie_id(), update)
            })
            .collect();
        updates
            .into_iter()
            .filter_map(|(id, update)| self.update(update, people).ok().map(|()| id))
            .collect()
    }

    /// Delete every movie matching `predicate`. Returns the deleted ids.
    pub fn destroy_all<P>(&mut self, predicate: P, people: &mut PersonStorage) -> Vec<MovieId>
    where
        P: Fn(&Movie) -> bool,
    {
        let ids: Vec<MovieId> = self
            .instances
            .values()
            .filter(|movie| predicate(movie))
            .map(Movie::movie_id)
            .collect();
        ids.into_iter()
            .filter(|id| self.destroy(*id, people).is_ok())
            .collect()
    }

    /// Remove every reference to a person that is being deleted.
    ///
    /// Movies the person directs or is the biography subject of cannot exist
    /// without them and are deleted; this is checked before the actor set, so
    /// a director who also acts in the same movie deletes it. Otherwise the
    /// person is dropped from the cast. Returns the deleted movie ids.
    pub fn remove_person_references(
        &mut self,
        person_id: PersonId,
        people: &mut PersonStorage,
    ) -> Vec<MovieId> {
        let mut deleted = Vec::new();
        let ids: Vec<MovieId> = self
            .instances
            .values()
            .filter(|movie| movie.referenced_people().any(|id| id == person_id))
            .map(Movie::movie_id)
            .collect();
        for movie_id in ids {
            let Some(movie) = self.instances.get_mut(&movie_id) else {
                continue;
            };
            if movie.director() == person_id || movie.about() == Some(person_id) {
                debug!(movie_id, person_id, "deleting movie that depends on the person");
                if self.destroy(movie_id, people).is_ok() {
                    deleted.push(movie_id);
                }
            } else if movie.remove_actor_id(person_id) {
                debug!(movie_id, person_id, "removed actor from cast");
                if let Some(person) = people.person_mut(person_id) {
                    person.unlink_played(movie_id);
                }
            }
        }
        deleted
    }

    /// Empty the collection.
    pub fn clear(&mut self) {
        self.instances.clear();
        self.next_id = None;
    }

    /// Replace the collection with the movies stored under
    /// [`MOVIE_STORAGE_KEY`], resolving people against `people` and
    /// rebuilding their backlinks and tags. A missing value leaves the
    /// collection as it is.
    pub fn retrieve_all(
        &mut self,
        store: &impl KeyValueStore,
        people: &mut PersonStorage,
    ) -> CoreResult<usize> {
        let Some(records) = load_records::<MovieRecord>(store, MOVIE_STORAGE_KEY)? else {
            info!("no stored movies");
            return Ok(0);
        };
        let mut loaded = BTreeMap::new();
        for record in records {
            if let Some(movie) = Movie::from_record(record, people.instances(), &self.rules) {
                let id = movie.movie_id();
                if loaded.insert(id, movie).is_some() {
                    warn!(movie_id = id, "duplicate movie record replaced an earlier one");
                }
            }
        }
        people.clear_backlinks();
        for movie in loaded.values() {
            link_references(people, movie);
        }

        let count = loaded.len();
        self.instances = loaded;
        self.next_id = None;
        info!(count, "movies loaded");
        Ok(count)
    }

    /// Write the whole collection under [`MOVIE_STORAGE_KEY`].
    pub fn persist(&self, store: &mut impl KeyValueStore) -> CoreResult<()> {
        let records: BTreeMap<MovieId, MovieRecord> = self
            .instances
            .iter()
            .map(|(id, movie)| (*id, movie.to_record()))
            .collect();
        save_records(store, MOVIE_STORAGE_KEY, &records)?;
        info!(count = records.len(), "movies persisted");
        Ok(())
    }
}

fn apply_movie_update(
    movie: &mut Movie,
    update: &MovieUpdate,
    people: &BTreeMap<PersonId, Person>,
    rules: &MovieRules,
) -> Validation {
    if let Some(title) = update.title.as_deref() {
        if title.trim() != movie.title() {
            movie.set_title(title)?;
        }
    }
    match &update.release_date {
        Change::Keep => {}
        Change::Clear => movie.set_release_date(None, rules)?,
        Change::Set(date) => movie.set_release_date(Some(date.as_str()), rules)?,
    }
    if let Some(director) = &update.director {
        if director.raw_id() != i64::from(movie.director()) {
            movie.set_director(director, people)?;
        }
    }
    for id in update.actors_to_add.raw_ids() {
        movie.add_actor(&PersonRef::Id(id), people)?;
    }
    for id in update.actors_to_remove.raw_ids() {
        movie.remove_actor(&PersonRef::Id(id))?;
    }
    match &update.category {
        Change::Keep => {}
        Change::Clear => movie.set_category(None)?,
        Change::Set(index) => movie.set_category(Some(*index))?,
    }
    match &update.about {
        Change::Keep => {}
        Change::Clear => movie.set_about(None, people)?,
        Change::Set(about) => movie.set_about(Some(about), people)?,
    }
    match &update.tv_series_name {
        Change::Keep => {}
        Change::Clear => movie.set_tv_series_name(None)?,
        Change::Set(name) => movie.set_tv_series_name(Some(name.as_str()))?,
    }
    match &update.episode_no {
        Change::Keep => {}
        Change::Clear => movie.set_episode_no(None)?,
        Change::Set(episode_no) => movie.set_episode_no(Some(*episode_no))?,
    }
    movie.check_category_fields()
}

fn link_references(people: &mut PersonStorage, movie: &Movie) {
    let movie_id = movie.movie_id();
    if let Some(director) = people.person_mut(movie.director()) {
        director.link_directed(movie_id);
        director.tag(PersonCategory::Director);
    }
    for actor_id in movie.actors() {
        if let Some(actor) = people.person_mut(*actor_id) {
            actor.link_played(movie_id);
            actor.tag(PersonCategory::Actor);
        }
    }
}

fn unlink_references(people: &mut PersonStorage, movie: &Movie) {
    let movie_id = movie.movie_id();
    if let Some(director) = people.person_mut(movie.director()) {
        director.unlink_directed(movie_id);
        if director.directed_movies().is_empty() {
            director.untag(PersonCategory::Director);
        }
    }
    for actor_id in movie.actors() {
        if let Some(actor) = people.person_mut(*actor_id) {
            actor.unlink_played(movie_id);
            if actor.played_movies().is_empty() {
                actor.untag(PersonCategory::Actor);
            }
        }
    }
}

/// Both collections bound to one store.
#[derive(Debug)]
pub struct Library<S> {
    store: S,
    people: PersonStorage,
    movies: MovieStorage,
}

impl<S: KeyValueStore> Library<S> {
    /// Create an empty library over `store`.
    pub fn new(store: S, rules: MovieRules) -> Self {
        Self {
            store,
            people: PersonStorage::new(),
            movies: MovieStorage::new(rules),
        }
    }

    /// Create a library and load both collections from `store`.
    pub fn open(store: S, rules: MovieRules) -> CoreResult<Self> {
        let mut library = Self::new(store, rules);
        library.retrieve_all()?;
        Ok(library)
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The person collection.
    pub fn people(&self) -> &PersonStorage {
        &self.people
    }

    /// The movie collection.
    pub fn movies(&self) -> &MovieStorage {
        &self.movies
    }

    /// See [`PersonStorage::add`].
    pub fn add_person(&mut self, slots: PersonSlots) -> CoreResult<PersonId> {
        self.people.add(slots)
    }

    /// See [`PersonStorage::update`].
    pub fn update_person(&mut self, update: PersonUpdate) -> CoreResult<()> {
        self.people.update(update)
    }

    /// See [`PersonStorage::destroy`].
    pub fn destroy_person(&mut self, id: PersonId) -> CoreResult<()> {
        self.people.destroy(id, &mut self.movies)
    }

    /// See [`MovieStorage::add`].
    pub fn add_movie(&mut self, slots: MovieSlots) -> CoreResult<MovieId> {
        self.movies.add(slots, &mut self.people)
    }

    /// See [`MovieStorage::update`].
    pub fn update_movie(&mut self, update: MovieUpdate) -> CoreResult<()> {
        self.movies.update(update, &mut self.people)
    }

    /// See [`MovieStorage::destroy`].
    pub fn destroy_movie(&mut self, id: MovieId) -> CoreResult<()> {
        self.movies.destroy(id, &mut self.people)
    }

    /// See [`MovieStorage::update_all`].
    pub fn update_movies<P, F>(&mut self, predicate: P, make_update: F) -> Vec<MovieId>
    where
        P: Fn(&Movie) -> bool,
        F: Fn(&Movie) -> MovieUpdate,
    {
        self.movies.update_all(predicate, make_update, &mut self.people)
    }

    /// See [`MovieStorage::destroy_all`].
    pub fn destroy_movies<P>(&mut self, predicate: P) -> Vec<MovieId>
    where
        P: Fn(&Movie) -> bool,
    {
        self.movies.destroy_all(predicate, &mut self.people)
    }

    /// The id the next person gets when none is given.
    pub fn next_person_id(&mut self) -> PersonId {
        self.people.next_id()
    }

    /// Reload both collections, people first. On failure the in-memory
    /// collections are left untouched.
    pub fn retrieve_all(&mut self) -> CoreResult<()> {
        let mut people = PersonStorage::new();
        people.retrieve_all(&self.store)?;
        let mut movies = MovieStorage::new(*self.movies.rules());
        movies.retrieve_all(&self.store, &mut people)?;
        self.people = people;
        self.movies = movies;
        Ok(())
    }

    /// Write both collections to the store, people first.
    ///
    /// The writes are not one transaction: when the movie write fails the
    /// stored people are already newer than the stored movies. Loading drops
    /// movies whose director or subject is gone, so such a store still loads.
    pub fn persist(&mut self) -> CoreResult<()> {
        self.people.persist(&mut self.store)?;
        self.movies.persist(&mut self.store)
    }

    /// Delete all data, in memory and in the store.
    pub fn clear_data(&mut self) -> CoreResult<()> {
        self.store.remove_item(MOVIE_STORAGE_KEY)?;
        self.store.remove_item(PERSON_STORAGE_KEY)?;
        self.people.clear();
        self.movies.clear();
        info!("all data cleared");
        Ok(())
    }

    /// Replace all data with a fixed sample set and persist it.
    pub fn create_test_data(&mut self) -> CoreResult<()> {
        self.people.clear();
        self.movies.clear();
        for slots in sample_people() {
            self.add_person(slots)?;
        }
        for slots in sample_movies() {
            self.add_movie(slots)?;
        }
        self.persist()?;
        info!(
            people = self.people.len(),
            movies = self.movies.len(),
            "test data created"
        );
        Ok(())
    }
}

fn person(id: i64, name: &str, agent: Option<i64>) -> PersonSlots {
    PersonSlots {
        person_id: Some(id),
        name: Some(name.into()),
        categories: Vec::new(),
        agent: agent.map(PersonRef::Id),
    }
}

fn sample_people() -> Vec<PersonSlots> {
    vec![
        person(17, "Hylda Queally", None),
        person(1, "Stephen Frears", None),
        person(2, "George Lucas", None),
        person(3, "Quentin Tarantino", None),
        person(5, "Uma Thurman", Some(17)),
        person(6, "John Travolta", None),
        person(7, "Ewan McGregor", None),
        person(8, "Natalie Portman", None),
        person(9, "Keanu Reeves", None),
        person(10, "Russell Crowe", Some(17)),
        person(12, "Naomi Watts", None),
        person(13, "Ed Harris", None),
        person(14, "Marc Forster", None),
        person(15, "John Forbes Nash", None),
        person(16, "Ron Howard", None),
        person(18, "Tim Van Patten", None),
        person(19, "Sean Bean", None),
    ]
}

fn sample_movies() -> Vec<MovieSlots> {
    let movie = |id: i64, title: &str, date: &str, director: i64, actors: Vec<i64>| MovieSlots {
        movie_id: Some(id),
        title: Some(title.into()),
        release_date: Some(date.into()),
        director: Some(PersonRef::Id(director)),
        actors: actors.into(),
        ..MovieSlots::default()
    };
    vec![
        movie(1, "Pulp Fiction", "1994-05-12", 3, vec![3, 5, 6]),
        movie(2, "Star Wars", "1977-05-25", 2, vec![7, 8]),
        movie(3, "Dangerous Liaisons", "1988-12-16", 1, vec![9, 5]),
        MovieSlots {
            category: Some(1),
            about: Some(PersonRef::Id(15)),
            ..movie(4, "A Beautiful Mind", "2001-12-21", 16, vec![10, 13])
        },
        movie(5, "Stay", "2005-09-24", 14, vec![7, 12]),
        MovieSlots {
            category: Some(2),
            tv_series_name: Some("Game of Thrones".into()),
            episode_no: Some(2),
            ..movie(6, "The Kingsroad", "2011-04-24", 18, vec![19])
        },
    ]
}

/// Filesystem-backed store keeping one `<key>.json` file per key.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a store rooted at the provided path.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root path of the store.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve the default store path (~/.cinevault).
    pub fn default_path() -> CoreResult<PathBuf> {
        if let Some(dir) = dirs::home_dir() {
            return Ok(dir.join(format!(".{STORE_DIR_NAME}")));
        }
        Err(CoreError::Storage(
            "unable to determine a default store path".into(),
        ))
    }

    /// Check if the store directory exists.
    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Create the store directory.
    pub fn init(&self) -> CoreResult<()> {
        fs::create_dir_all(&self.root).map_err(storage_error)
    }

    fn item_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl KeyValueStore for FsStore {
    fn get_item(&self, key: &str) -> CoreResult<Option<String>> {
        cv_utils::read_optional(&self.item_path(key)).map_err(storage_error)
    }

    fn set_item(&mut self, key: &str, value: &str) -> CoreResult<()> {
        cv_utils::write_atomic(&self.item_path(key), value).map_err(storage_error)
    }

    fn remove_item(&mut self, key: &str) -> CoreResult<()> {
        match fs::remove_file(self.item_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_error(err)),
        }
    }
}

/// In-memory store with an optional byte quota, like a browser's local storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    items: BTreeMap<String, String>,
    quota: Option<usize>,
}

impl MemoryStore {
    /// Create an empty store without a quota.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store holding at most `bytes` of keys and values.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            items: BTreeMap::new(),
            quota: Some(bytes),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(self.items.get(key).cloned())
    }

    fn set_item(&mut self, key: &str, value: &str) -> CoreResult<()> {
        if let Some(quota) = self.quota {
            let used: usize = self
                .items
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(existing, text)| existing.len() + text.len())
                .sum();
            if used + key.len() + value.len() > quota {
                return Err(CoreError::Storage(format!(
                    "quota of {quota} bytes exceeded while writing {key:?}"
                )));
            }
        }
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&mut self, key: &str) -> CoreResult<()> {
        self.items.remove(key);
        Ok(())
    }
}

/// User configuration, stored as YAML.
#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LibraryConfig {
    /// Store directory.
    #[serde(default)]
    pub path: Option<String>,
    /// Reject movies without a release date.
    #[serde(default)]
    pub release_date_required: bool,
}

impl LibraryConfig {
    /// Movie validation rules derived from the configuration.
    pub fn movie_rules(&self) -> MovieRules {
        MovieRules {
            release_date_required: self.release_date_required,
        }
    }
}

fn config_path() -> CoreResult<PathBuf> {
    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(STORE_DIR_NAME).join(CONFIG_FILE_NAME));
    }
    Err(CoreError::Storage(
        "unable to determine config directory".into(),
    ))
}

/// Load the user configuration, falling back to defaults when absent.
pub fn load_config() -> CoreResult<LibraryConfig> {
    load_config_from(&config_path()?)
}

/// Load a configuration file, falling back to defaults when absent.
pub fn load_config_from(path: &Path) -> CoreResult<LibraryConfig> {
    let Some(contents) = cv_utils::read_optional(path).map_err(storage_error)? else {
        return Ok(LibraryConfig::default());
    };
    serde_yaml::from_str(&contents).map_err(storage_error)
}

/// Save the user configuration.
pub fn save_config(config: &LibraryConfig) -> CoreResult<()> {
    save_config_to(&config_path()?, config)
}

/// Save a configuration file.
pub fn save_config_to(path: &Path, config: &LibraryConfig) -> CoreResult<()> {
    let contents = serde_yaml::to_string(config).map_err(storage_error)?;
    cv_utils::write_atomic(path, &contents).map_err(storage_error)
}

/// Remember `path` as the store directory, keeping other settings.
pub fn set_config_path(path: &Path) -> CoreResult<()> {
    let mut config = load_config()?;
    config.path = Some(path.to_string_lossy().to_string());
    save_config(&config)
}

/// Resolve the store directory: `CINEVAULT_PATH`, then the configured path,
/// then `~/.cinevault`.
pub fn resolve_store_path(config: &LibraryConfig) -> CoreResult<PathBuf> {
    resolve_store_path_with(std::env::var(PATH_ENV_VAR).ok(), config)
}

fn resolve_store_path_with(env: Option<String>, config: &LibraryConfig) -> CoreResult<PathBuf> {
    let candidates = [env, config.path.clone()];
    if let Some(path) = candidates
        .into_iter()
        .flatten()
        .find(|path| !path.trim().is_empty())
    {
        return Ok(PathBuf::from(path));
    }
    FsStore::default_path()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::{MovieCategory, PersonRefs, MAX_ID};
    use tempfile::TempDir;

    fn named(id: i64, name: &str) -> PersonSlots {
        person(id, name, None)
    }

    fn library() -> Library<MemoryStore> {
        Library::new(MemoryStore::new(), MovieRules::default())
    }

    /// Lucas (1) directs movie 1, Crowe (2) plays in it.
    fn scenario() -> Library<MemoryStore> {
        let mut library = library();
        library.add_person(named(1, "Lucas")).unwrap();
        library.add_person(named(2, "Crowe")).unwrap();
        library
            .add_movie(MovieSlots {
                movie_id: Some(1),
                title: Some("X".into()),
                director: Some(PersonRef::Id(1)),
                actors: vec![2_i64].into(),
                ..MovieSlots::default()
            })
            .unwrap();
        library
    }

    fn violation_kind(err: &CoreError) -> &'static str {
        err.violation().map_or("none", ConstraintViolation::kind)
    }

    #[test]
    fn add_then_contains() {
        let library = scenario();
        assert!(library.people().contains(1));
        assert!(library.movies().contains(1));
        let movie = library.movies().get(1).unwrap();
        assert!(movie.actors().contains(&2));
        assert!(library.people().get(1).unwrap().has_category(PersonCategory::Director));
        assert!(library.people().get(2).unwrap().has_category(PersonCategory::Actor));
        assert!(library.people().get(2).unwrap().played_movies().contains(&1));
    }

    #[test]
    fn destroying_sole_director_cascades_to_movie() {
        let mut library = scenario();
        library.destroy_person(1).unwrap();
        assert!(!library.people().contains(1));
        assert!(!library.movies().contains(1));
        let crowe = library.people().get(2).unwrap();
        assert!(!crowe.has_category(PersonCategory::Actor));
        assert!(crowe.played_movies().is_empty());
    }

    #[test]
    fn destroying_actor_keeps_movie() {
        let mut library = scenario();
        library.destroy_person(2).unwrap();
        let movie = library.movies().get(1).unwrap();
        assert!(movie.actors().is_empty());
        assert_eq!(movie.director(), 1);
    }

    #[test]
    fn destroying_director_who_also_acts_deletes_movie() {
        let mut library = scenario();
        library
            .update_movie(MovieUpdate {
                movie_id: 1,
                actors_to_add: vec![1_i64].into(),
                ..MovieUpdate::default()
            })
            .unwrap();
        library.destroy_person(1).unwrap();
        assert!(!library.movies().contains(1));
    }

    #[test]
    fn destroying_biography_subject_deletes_movie() {
        let mut library = scenario();
        library.add_person(named(3, "John Nash")).unwrap();
        library
            .add_movie(MovieSlots {
                movie_id: Some(2),
                title: Some("A Beautiful Mind".into()),
                director: Some(PersonRef::Id(1)),
                category: Some(1),
                about: Some(PersonRef::Id(3)),
                ..MovieSlots::default()
            })
            .unwrap();
        library.destroy_person(3).unwrap();
        assert!(!library.movies().contains(2));
        assert!(library.movies().contains(1));
        assert_eq!(library.people().get(1).unwrap().directed_movies().len(), 1);
    }

    #[test]
    fn duplicate_add_is_rejected_without_overwriting() {
        let mut library = scenario();
        let err = library.add_person(named(1, "Someone Else")).unwrap_err();
        assert_eq!(violation_kind(&err), "UniquenessConstraintViolation");
        assert_eq!(library.people().len(), 2);
        assert_eq!(library.people().get(1).unwrap().name(), "Lucas");
    }

    #[test]
    fn failed_person_update_rolls_back() {
        let mut library = scenario();
        let err = library
            .update_person(PersonUpdate {
                person_id: 1,
                name: Some("B".into()),
                agent: Change::Set(PersonRef::Id(9999)),
            })
            .unwrap_err();
        assert_eq!(violation_kind(&err), "ReferentialIntegrityConstraintViolation");
        let lucas = library.people().get(1).unwrap();
        assert_eq!(lucas.name(), "Lucas");
        assert_eq!(lucas.agent(), None);
    }

    #[test]
    fn failed_movie_update_rolls_back() {
        let mut library = scenario();
        let err = library
            .update_movie(MovieUpdate {
                movie_id: 1,
                title: Some("B".into()),
                director: Some(PersonRef::Id(9999)),
                ..MovieUpdate::default()
            })
            .unwrap_err();
        assert_eq!(violation_kind(&err), "ReferentialIntegrityConstraintViolation");
        let movie = library.movies().get(1).unwrap();
        assert_eq!(movie.title(), "X");
        assert_eq!(movie.director(), 1);
    }

    #[test]
    fn update_of_unknown_record_is_not_found() {
        let mut library = scenario();
        let err = library
            .update_person(PersonUpdate {
                person_id: 40,
                ..PersonUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { id: 40, .. }));
        assert!(matches!(
            library.destroy_movie(8),
            Err(CoreError::NotFound { id: 8, .. })
        ));
    }

    #[test]
    fn director_change_moves_tags() {
        let mut library = scenario();
        library
            .update_movie(MovieUpdate {
                movie_id: 1,
                director: Some(PersonRef::Id(2)),
                actors_to_remove: vec![2_i64].into(),
                ..MovieUpdate::default()
            })
            .unwrap();
        let lucas = library.people().get(1).unwrap();
        let crowe = library.people().get(2).unwrap();
        assert!(!lucas.has_category(PersonCategory::Director));
        assert!(crowe.has_category(PersonCategory::Director));
        assert!(!crowe.has_category(PersonCategory::Actor));
    }

    #[test]
    fn movie_category_is_frozen_across_updates() {
        let mut library = scenario();
        library.add_person(named(3, "John Nash")).unwrap();
        library
            .update_movie(MovieUpdate {
                movie_id: 1,
                category: Change::Set(1),
                about: Change::Set(PersonRef::Id(3)),
                ..MovieUpdate::default()
            })
            .unwrap();

        let err = library
            .update_movie(MovieUpdate {
                movie_id: 1,
                category: Change::Set(2),
                tv_series_name: Change::Set("Series".into()),
                episode_no: Change::Set(1),
                ..MovieUpdate::default()
            })
            .unwrap_err();
        assert_eq!(violation_kind(&err), "FrozenValueConstraintViolation");

        let err = library
            .update_movie(MovieUpdate {
                movie_id: 1,
                category: Change::Clear,
                ..MovieUpdate::default()
            })
            .unwrap_err();
        assert_eq!(violation_kind(&err), "FrozenValueConstraintViolation");

        let movie = library.movies().get(1).unwrap();
        assert_eq!(movie.category(), Some(MovieCategory::Biography));
        assert_eq!(movie.about(), Some(3));
    }

    #[test]
    fn setting_category_without_its_fields_is_rejected() {
        let mut library = scenario();
        let err = library
            .update_movie(MovieUpdate {
                movie_id: 1,
                category: Change::Set(2),
                tv_series_name: Change::Set("Series".into()),
                ..MovieUpdate::default()
            })
            .unwrap_err();
        assert_eq!(violation_kind(&err), "MandatoryValueConstraintViolation");
        assert_eq!(library.movies().get(1).unwrap().category(), None);
    }

    #[test]
    fn next_id_recomputes_after_deleting_highest() {
        let mut library = scenario();
        library.add_person(named(7, "Ed Harris")).unwrap();
        assert_eq!(library.next_person_id(), 8);
        library.destroy_person(7).unwrap();
        assert_eq!(library.next_person_id(), 3);
        assert!(!library.people().contains(7));

        let id = library.add_person(PersonSlots {
            name: Some("Naomi Watts".into()),
            ..PersonSlots::default()
        });
        assert_eq!(id.unwrap(), 3);
        assert_eq!(library.next_person_id(), 4);
    }

    #[test]
    fn agent_tag_follows_agent_links() {
        let mut library = scenario();
        library.add_person(person(3, "Hylda Queally", None)).unwrap();
        library
            .update_person(PersonUpdate {
                person_id: 2,
                agent: Change::Set(PersonRef::Id(3)),
                ..PersonUpdate::default()
            })
            .unwrap();
        assert!(library.people().get(3).unwrap().has_category(PersonCategory::Agent));

        library.destroy_person(3).unwrap();
        assert_eq!(library.people().get(2).unwrap().agent(), None);
    }

    #[test]
    fn batch_operations_apply_predicate() {
        let mut library = library();
        library.create_test_data().unwrap();
        let updated = library.update_movies(
            |movie| movie.director() == 3,
            |_| MovieUpdate {
                title: Some("Pulp Fiction (Remastered)".into()),
                ..MovieUpdate::default()
            },
        );
        assert_eq!(updated, vec![1]);
        assert_eq!(
            library.movies().get(1).unwrap().title(),
            "Pulp Fiction (Remastered)"
        );

        let deleted = library.destroy_movies(|movie| movie.actors().contains(&7));
        assert_eq!(deleted, vec![2, 5]);
        assert_eq!(library.movies().len(), 4);
        assert!(!library.people().get(7).unwrap().has_category(PersonCategory::Actor));
    }

    #[test]
    fn persisted_layout_matches_record_shape() {
        let mut library = library();
        library.add_person(person(3, "Hylda Queally", None)).unwrap();
        library.add_person(named(1, "George Lucas")).unwrap();
        library.add_person(person(2, "Russell Crowe", Some(3))).unwrap();
        library
            .add_movie(MovieSlots {
                movie_id: Some(1),
                title: Some("X".into()),
                director: Some(PersonRef::Id(1)),
                actors: PersonRefs::from(vec![2_i64]),
                ..MovieSlots::default()
            })
            .unwrap();
        library.persist().unwrap();

        let people = library.store().get_item(PERSON_STORAGE_KEY).unwrap().unwrap();
        insta::assert_snapshot!(people, @r#"{"1":{"personId":1,"name":"George Lucas","categories":[1],"agent":null},"2":{"personId":2,"name":"Russell Crowe","categories":[2],"agent":3},"3":{"personId":3,"name":"Hylda Queally","categories":[3],"agent":null}}"#);
        let movies = library.store().get_item(MOVIE_STORAGE_KEY).unwrap().unwrap();
        insta::assert_snapshot!(movies, @r#"{"1":{"movieId":1,"title":"X","director":1,"actors":[2]}}"#);
    }

    #[test]
    fn persist_and_retrieve_round_trip() {
        let mut library = library();
        library.create_test_data().unwrap();
        let people = library.people().instances().clone();
        let movies = library.movies().instances().clone();

        let reopened = Library::open(library.store().clone(), MovieRules::default()).unwrap();
        assert_eq!(reopened.people().instances(), &people);
        assert_eq!(reopened.movies().instances(), &movies);
        let biography = reopened.movies().get(4).unwrap();
        assert_eq!(biography.about(), Some(15));
        let uma = reopened.people().get(5).unwrap();
        assert_eq!(uma.played_movies().iter().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert!(reopened.people().get(17).unwrap().has_category(PersonCategory::Agent));
    }

    #[test]
    fn retrieve_tolerates_missing_and_invalid_data() {
        let library = Library::open(MemoryStore::new(), MovieRules::default()).unwrap();
        assert!(library.people().is_empty());

        let mut store = MemoryStore::new();
        store
            .set_item(
                PERSON_STORAGE_KEY,
                r#"{"1":{"personId":1,"name":"Lucas","categories":[],"agent":4},
                    "2":{"personId":2,"name":"","categories":[],"agent":null},
                    "3":{"personId":"three"},
                    "4":{"personId":4,"name":"Agent","categories":[],"agent":null},
                    "5":{"personId":5,"name":"Orphan","categories":[],"agent":99}}"#,
            )
            .unwrap();
        store
            .set_item(
                MOVIE_STORAGE_KEY,
                r#"{"1":{"movieId":1,"title":"Kept","director":1,"actors":[5]},
                    "2":{"movieId":2,"title":"Dropped","director":2,"actors":[]}}"#,
            )
            .unwrap();

        let library = Library::open(store, MovieRules::default()).unwrap();
        let ids: Vec<_> = library.people().instances().keys().copied().collect();
        assert_eq!(ids, vec![1, 4, 5]);
        assert_eq!(library.people().get(1).unwrap().agent(), Some(4));
        assert!(library.people().get(4).unwrap().has_category(PersonCategory::Agent));
        assert_eq!(library.people().get(5).unwrap().agent(), None);
        assert_eq!(library.movies().len(), 1);
        assert!(library.people().get(5).unwrap().has_category(PersonCategory::Actor));
    }

    #[test]
    fn malformed_store_leaves_memory_untouched() {
        let mut library = scenario();
        library.persist().unwrap();
        let mut store = library.store().clone();
        store.set_item(MOVIE_STORAGE_KEY, "not json").unwrap();
        let mut broken = Library::new(store, MovieRules::default());
        broken.add_person(named(9, "Keanu Reeves")).unwrap();

        assert!(matches!(broken.retrieve_all(), Err(CoreError::Storage(_))));
        assert!(broken.people().contains(9));
        assert_eq!(broken.people().len(), 1);
    }

    #[test]
    fn quota_failure_keeps_previous_snapshot() {
        let mut library = Library::new(MemoryStore::with_quota(200), MovieRules::default());
        library.add_person(named(1, "Lucas")).unwrap();
        library.persist().unwrap();
        let before = library.store().get_item(PERSON_STORAGE_KEY).unwrap();

        for id in 2..10 {
            library.add_person(named(id, "A rather long name for a person")).unwrap();
        }
        assert!(matches!(library.persist(), Err(CoreError::Storage(_))));
        assert_eq!(library.store().get_item(PERSON_STORAGE_KEY).unwrap(), before);
        assert_eq!(library.people().len(), 9);
    }

    #[test]
    fn clear_data_empties_store_and_memory() {
        let mut library = library();
        library.create_test_data().unwrap();
        library.clear_data().unwrap();
        assert!(library.people().is_empty());
        assert!(library.movies().is_empty());
        assert!(library.store().get_item(PERSON_STORAGE_KEY).unwrap().is_none());
        assert!(library.store().get_item(MOVIE_STORAGE_KEY).unwrap().is_none());
    }

    #[test]
    fn fs_store_round_trip() {
        let temp = TempDir::new().expect("temp dir");
        let store = FsStore::new(temp.path().join("vault"));
        assert!(!store.exists());
        store.init().expect("init store");

        let mut library = Library::new(store.clone(), MovieRules::default());
        library.create_test_data().expect("seed");
        assert!(temp.path().join("vault").join("person.json").exists());

        let reopened = Library::open(store, MovieRules::default()).expect("reopen");
        assert_eq!(reopened.people().len(), library.people().len());
        assert_eq!(reopened.movies().len(), 6);
        assert_eq!(
            reopened.movies().get(6).unwrap().tv_series_name(),
            Some("Game of Thrones")
        );
    }

    #[test]
    fn fs_store_remove_ignores_missing_key() {
        let temp = TempDir::new().expect("temp dir");
        let mut store = FsStore::new(temp.path().to_path_buf());
        store.remove_item(MOVIE_STORAGE_KEY).expect("remove missing");
        assert!(store.get_item(MOVIE_STORAGE_KEY).unwrap().is_none());
    }

    #[test]
    fn config_round_trip_and_rules() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join(CONFIG_FILE_NAME);
        assert_eq!(load_config_from(&path).unwrap(), LibraryConfig::default());

        let config = LibraryConfig {
            path: Some("/srv/cinevault".into()),
            release_date_required: true,
        };
        save_config_to(&path, &config).unwrap();
        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.movie_rules().release_date_required);
    }

    #[test]
    fn store_path_prefers_env_then_config() {
        let config = LibraryConfig {
            path: Some("/from/config".into()),
            ..LibraryConfig::default()
        };
        assert_eq!(
            resolve_store_path_with(Some("/from/env".into()), &config).unwrap(),
            PathBuf::from("/from/env")
        );
        assert_eq!(
            resolve_store_path_with(Some("  ".into()), &config).unwrap(),
            PathBuf::from("/from/config")
        );
    }

    #[test]
    fn required_release_date_rule_applies() {
        let mut library = Library::new(
            MemoryStore::new(),
            MovieRules {
                release_date_required: true,
            },
        );
        library.add_person(named(1, "Lucas")).unwrap();
        let err = library
            .add_movie(MovieSlots {
                title: Some("Undated".into()),
                director: Some(PersonRef::Id(1)),
                ..MovieSlots::default()
            })
            .unwrap_err();
        assert_eq!(violation_kind(&err), "MandatoryValueConstraintViolation");
        assert!(library.movies().is_empty());
        assert!(!library.people().get(1).unwrap().has_category(PersonCategory::Director));
    }

    #[derive(Debug, Clone)]
    struct RejectingStore {
        inner: MemoryStore,
        rejected_key: &'static str,
    }

    impl KeyValueStore for RejectingStore {
        fn get_item(&self, key: &str) -> CoreResult<Option<String>> {
            self.inner.get_item(key)
        }

        fn set_item(&mut self, key: &str, value: &str) -> CoreResult<()> {
            if key == self.rejected_key {
                return Err(CoreError::Storage(format!("write to {key:?} refused")));
            }
            self.inner.set_item(key, value)
        }

        fn remove_item(&mut self, key: &str) -> CoreResult<()> {
            self.inner.remove_item(key)
        }
    }

    #[test]
    fn duplicate_movie_add_is_rejected_without_overwriting() {
        let mut library = scenario();
        let err = library
            .add_movie(MovieSlots {
                movie_id: Some(1),
                title: Some("Y".into()),
                director: Some(PersonRef::Id(2)),
                ..MovieSlots::default()
            })
            .unwrap_err();
        assert_eq!(violation_kind(&err), "UniquenessConstraintViolation");
        assert_eq!(library.movies().len(), 1);
        let movie = library.movies().get(1).unwrap();
        assert_eq!(movie.title(), "X");
        assert_eq!(movie.director(), 1);
        assert!(!library.people().get(2).unwrap().has_category(PersonCategory::Director));
    }

    #[test]
    fn person_counter_stops_at_max_id() {
        let mut people = PersonStorage::new();
        let err = people.add(named(i64::from(u32::MAX), "Too Far")).unwrap_err();
        assert_eq!(violation_kind(&err), "IntervalConstraintViolation");
        assert!(people.is_empty());

        assert_eq!(people.add(named(i64::from(MAX_ID), "Last")).unwrap(), MAX_ID);
        assert_eq!(people.next_id(), u32::MAX);
        let err = people
            .add(PersonSlots {
                name: Some("Overflow".into()),
                ..PersonSlots::default()
            })
            .unwrap_err();
        assert_eq!(violation_kind(&err), "IntervalConstraintViolation");
        assert_eq!(people.len(), 1);
    }

    #[test]
    fn movie_counter_stops_at_max_id() {
        let mut library = scenario();
        let slots = |id: Option<i64>| MovieSlots {
            movie_id: id,
            title: Some("Late".into()),
            director: Some(PersonRef::Id(1)),
            ..MovieSlots::default()
        };
        let err = library.add_movie(slots(Some(i64::from(u32::MAX)))).unwrap_err();
        assert_eq!(violation_kind(&err), "IntervalConstraintViolation");

        assert_eq!(library.add_movie(slots(Some(i64::from(MAX_ID)))).unwrap(), MAX_ID);
        let err = library.add_movie(slots(None)).unwrap_err();
        assert_eq!(violation_kind(&err), "IntervalConstraintViolation");
        assert_eq!(library.movies().len(), 2);
    }

    #[test]
    fn stored_ids_beyond_max_are_skipped() {
        let mut store = MemoryStore::new();
        store
            .set_item(
                PERSON_STORAGE_KEY,
                r#"{"4294967295":{"personId":4294967295,"name":"Max","categories":[],"agent":null},
                    "4294967294":{"personId":4294967294,"name":"Last","categories":[],"agent":null}}"#,
            )
            .unwrap();
        let mut library = Library::open(store, MovieRules::default()).unwrap();
        let ids: Vec<_> = library.people().instances().keys().copied().collect();
        assert_eq!(ids, vec![MAX_ID]);
        assert_eq!(library.next_person_id(), u32::MAX);
    }

    #[test]
    fn failed_movie_write_leaves_loadable_store() {
        let mut library = scenario();
        library.persist().unwrap();
        let store = RejectingStore {
            inner: library.store().clone(),
            rejected_key: MOVIE_STORAGE_KEY,
        };
        let mut library = Library::open(store, MovieRules::default()).unwrap();
        library.destroy_person(1).unwrap();
        library.add_person(named(3, "Ed Harris")).unwrap();
        assert!(matches!(library.persist(), Err(CoreError::Storage(_))));

        let reopened = Library::open(library.store().inner.clone(), MovieRules::default()).unwrap();
        let ids: Vec<_> = reopened.people().instances().keys().copied().collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(reopened.movies().is_empty());
    }
}
