use std::io::Write;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

use cv_core::{
    parse_integer, Change, CoreError, Enumeration, KeyValueStore, Movie, MovieCategory,
    MovieSlots, MovieUpdate, Person, PersonCategory, PersonRef, PersonRefs, PersonSlots,
    PersonUpdate,
};
use cv_store::{load_config, resolve_store_path, set_config_path, FsStore, Library};

#[derive(Parser)]
#[command(name = "cinevault", version, about = "CineVault movie library")]
struct Cli {
    /// Print debug logs to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the library store.
    Init {
        /// Optional path to initialize the store at.
        #[arg(long)]
        path: Option<String>,
    },
    /// Manage people.
    #[command(subcommand)]
    Person(PersonCommand),
    /// Manage movies.
    #[command(subcommand)]
    Movie(MovieCommand),
    /// Replace all data with a sample set.
    Seed,
    /// Delete all people and movies.
    Clear,
}

#[derive(Subcommand)]
enum PersonCommand {
    /// Add a person.
    Add {
        /// Person id; the next free id when omitted.
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_enum)]
        category: Vec<PersonCategoryArg>,
        /// Id of the person's agent.
        #[arg(long)]
        agent: Option<String>,
    },
    /// Change a person's name or agent.
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, conflicts_with = "clear_agent")]
        agent: Option<String>,
        #[arg(long)]
        clear_agent: bool,
    },
    /// Delete a person and the movies that depend on them.
    Delete { id: String },
    /// List all people.
    List,
}

#[derive(Subcommand)]
enum MovieCommand {
    /// Add a movie.
    Add {
        /// Movie id; the next free id when omitted.
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        title: Option<String>,
        /// Release date as YYYY-MM-DD.
        #[arg(long)]
        release_date: Option<String>,
        /// Id of the director.
        #[arg(long)]
        director: Option<String>,
        /// Id of an actor; repeat for several.
        #[arg(long)]
        actor: Vec<String>,
        #[arg(long, value_enum)]
        category: Option<MovieCategoryArg>,
        /// Id of the biography subject.
        #[arg(long)]
        about: Option<String>,
        #[arg(long)]
        tv_series_name: Option<String>,
        #[arg(long)]
        episode_no: Option<String>,
    },
    /// Change fields of a movie.
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long, conflicts_with = "clear_release_date")]
        release_date: Option<String>,
        #[arg(long)]
        clear_release_date: bool,
        #[arg(long)]
        director: Option<String>,
        #[arg(long)]
        add_actor: Vec<String>,
        #[arg(long)]
        remove_actor: Vec<String>,
        /// Category; can only be set once.
        #[arg(long, value_enum)]
        category: Option<MovieCategoryArg>,
        #[arg(long)]
        about: Option<String>,
        #[arg(long)]
        tv_series_name: Option<String>,
        #[arg(long)]
        episode_no: Option<String>,
    },
    /// Delete a movie.
    Delete { id: String },
    /// List all movies.
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum PersonCategoryArg {
    Director,
    Actor,
    Agent,
}

impl From<PersonCategoryArg> for PersonCategory {
    fn from(value: PersonCategoryArg) -> Self {
        match value {
            PersonCategoryArg::Director => PersonCategory::Director,
            PersonCategoryArg::Actor => PersonCategory::Actor,
            PersonCategoryArg::Agent => PersonCategory::Agent,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MovieCategoryArg {
    Biography,
    TvSeriesEpisode,
}

impl From<MovieCategoryArg> for MovieCategory {
    fn from(value: MovieCategoryArg) -> Self {
        match value {
            MovieCategoryArg::Biography => MovieCategory::Biography,
            MovieCategoryArg::TvSeriesEpisode => MovieCategory::TvSeriesEpisode,
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cv_utils::init_tracing(cli.verbose).context("failed to initialize logging")?;
    let config = load_config().context("failed to load config")?;

    if let Command::Init { path } = &cli.command {
        let path = match path {
            Some(path) => std::path::PathBuf::from(path),
            None => FsStore::default_path()?,
        };
        let store = FsStore::new(path.clone());
        store.init().context("failed to initialize store")?;
        set_config_path(&path)?;
        println!("Library initialized at {}", path.display());
        return Ok(());
    }

    let store = FsStore::new(resolve_store_path(&config)?);
    if !store.exists() {
        return Err(anyhow!(
            "CineVault is not initialized. Run `cinevault init` to get started."
        ));
    }
    debug!(path = %store.path().display(), "opening library");
    let mut library =
        Library::open(store, config.movie_rules()).context("failed to load library")?;
    execute(&mut library, cli.command, &mut std::io::stdout().lock())
}

fn execute<S: KeyValueStore>(
    library: &mut Library<S>,
    command: Command,
    out: &mut impl Write,
) -> Result<()> {
    match command {
        Command::Person(command) => person(library, command, out),
        Command::Movie(command) => movie(library, command, out),
        Command::Seed => {
            library
                .create_test_data()
                .context("failed to create test data")?;
            writeln!(
                out,
                "Created {} people and {} movies",
                library.people().len(),
                library.movies().len()
            )?;
            Ok(())
        }
        Command::Clear => {
            library.clear_data().context("failed to clear data")?;
            writeln!(out, "All data cleared")?;
            Ok(())
        }
        Command::Init { .. } => unreachable!("handled in run"),
    }
}

fn person<S: KeyValueStore>(
    library: &mut Library<S>,
    command: PersonCommand,
    out: &mut impl Write,
) -> Result<()> {
    match command {
        PersonCommand::Add {
            id,
            name,
            category,
            agent,
        } => {
            let slots = PersonSlots {
                person_id: optional_id("person ID", id)?,
                name,
                categories: category
                    .into_iter()
                    .map(|arg| PersonCategory::from(arg).index())
                    .collect(),
                agent: optional_ref("agent ID", agent)?,
            };
            let id = library.add_person(slots).context("failed to add person")?;
            save(library)?;
            writeln!(out, "Person {id} added")?;
        }
        PersonCommand::Update {
            id,
            name,
            agent,
            clear_agent,
        } => {
            let person_id = parse_id("person ID", &id)?;
            let agent = if clear_agent {
                Change::Clear
            } else {
                optional_ref("agent ID", agent)?.map_or(Change::Keep, Change::Set)
            };
            library
                .update_person(PersonUpdate {
                    person_id,
                    name,
                    agent,
                })
                .context("failed to update person")?;
            save(library)?;
            writeln!(out, "Person {person_id} updated")?;
        }
        PersonCommand::Delete { id } => {
            let person_id = Person::check_person_id(Some(parse_id("person ID", &id)?))
                .map_err(CoreError::from)?;
            library
                .destroy_person(person_id)
                .context("failed to delete person")?;
            save(library)?;
            writeln!(out, "Person {person_id} deleted")?;
        }
        PersonCommand::List => {
            for person in library.people().instances().values() {
                writeln!(out, "{person}")?;
            }
        }
    }
    Ok(())
}

fn movie<S: KeyValueStore>(
    library: &mut Library<S>,
    command: MovieCommand,
    out: &mut impl Write,
) -> Result<()> {
    match command {
        MovieCommand::Add {
            id,
            title,
            release_date,
            director,
            actor,
            category,
            about,
            tv_series_name,
            episode_no,
        } => {
            let slots = MovieSlots {
                movie_id: optional_id("movie ID", id)?,
                title,
                release_date,
                director: optional_ref("director ID", director)?,
                actors: refs("actor ID", actor)?,
                category: category.map(|arg| MovieCategory::from(arg).index()),
                about: optional_ref("subject ID", about)?,
                tv_series_name,
                episode_no: optional_id("episode number", episode_no)?,
            };
            let id = library.add_movie(slots).context("failed to add movie")?;
            save(library)?;
            writeln!(out, "Movie {id} added")?;
        }
        MovieCommand::Update {
            id,
            title,
            release_date,
            clear_release_date,
            director,
            add_actor,
            remove_actor,
            category,
            about,
            tv_series_name,
            episode_no,
        } => {
            let movie_id = parse_id("movie ID", &id)?;
            let release_date = if clear_release_date {
                Change::Clear
            } else {
                release_date.map_or(Change::Keep, Change::Set)
            };
            let update = MovieUpdate {
                movie_id,
                title,
                release_date,
                director: optional_ref("director ID", director)?,
                actors_to_add: refs("actor ID", add_actor)?,
                actors_to_remove: refs("actor ID", remove_actor)?,
                category: category
                    .map_or(Change::Keep, |arg| Change::Set(MovieCategory::from(arg).index())),
                about: optional_ref("subject ID", about)?.map_or(Change::Keep, Change::Set),
                tv_series_name: tv_series_name.map_or(Change::Keep, Change::Set),
                episode_no: optional_id("episode number", episode_no)?
                    .map_or(Change::Keep, Change::Set),
            };
            library
                .update_movie(update)
                .context("failed to update movie")?;
            save(library)?;
            writeln!(out, "Movie {movie_id} updated")?;
        }
        MovieCommand::Delete { id } => {
            let movie_id = Movie::check_movie_id(Some(parse_id("movie ID", &id)?))
                .map_err(CoreError::from)?;
            library
                .destroy_movie(movie_id)
                .context("failed to delete movie")?;
            save(library)?;
            writeln!(out, "Movie {movie_id} deleted")?;
        }
        MovieCommand::List => {
            for movie in library.movies().instances().values() {
                writeln!(out, "{movie}")?;
            }
        }
    }
    Ok(())
}

fn save<S: KeyValueStore>(library: &mut Library<S>) -> Result<()> {
    library.persist().context("failed to save library")
}

fn parse_id(field: &str, text: &str) -> Result<i64> {
    Ok(parse_integer(field, text).map_err(CoreError::from)?)
}

fn optional_id(field: &str, text: Option<String>) -> Result<Option<i64>> {
    text.map(|text| parse_id(field, &text)).transpose()
}

fn optional_ref(field: &str, text: Option<String>) -> Result<Option<PersonRef>> {
    Ok(optional_id(field, text)?.map(PersonRef::Id))
}

fn refs(field: &str, texts: Vec<String>) -> Result<PersonRefs> {
    let ids = texts
        .iter()
        .map(|text| parse_id(field, text))
        .collect::<Result<Vec<_>>>()?;
    Ok(PersonRefs::from(ids))
}
