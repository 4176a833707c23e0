//! Headless mode for the d20 engine.
//!
//! A line-oriented protocol over stdin/stdout, suitable for scripting and
//! automated testing. Every line is a `#` command; results are printed as
//! pretty JSON after a `[RESULT]` marker.

use d20_core::options::OptionalSelection;
use d20_core::persist::{self, SavedRoster};
use d20_core::resources::RestPeriod;
use d20_core::testing::{sample_archer, sample_fighter, sample_wizard};
use d20_core::{Actor, ActorId, ActorStore, Engine, EngineConfig, InvocationOptions, SeededRoller, User};
use serde::Serialize;
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, info};

/// Startup options parsed from the command line.
#[derive(Debug, Clone, Default)]
pub struct HeadlessConfig {
    pub roster: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub seed: Option<u64>,
    /// Act as the player controlling the actor of this name instead of the
    /// game master.
    pub player: Option<String>,
}

/// What one command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Json(Value),
    Error(String),
    Quit,
}

impl Reply {
    fn json(value: &impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Reply::Json(value),
            Err(e) => Reply::Error(format!("Could not encode result: {e}")),
        }
    }
}

const HELP: &str = "\
  #actors                          - List the roster
  #status <actor>                  - Show an actor's pools
  #use <actor> <entity> [k=v] [{json}]
                                   - Invoke an entity (single attack)
  #full <actor> <entity> [k=v] [{json}]
                                   - Invoke with a full attack
      k=v: ammo=<name>, source=<name>, power=<n>, amount=<n>, ac=<n>
  #recharge <actor> <entity> <n>   - Return n charges
  #rest <actor> encounter|day|week - Refresh pools
  #save <path>                     - Save the roster
  #load <path>                     - Load a roster
  #saves <dir>                     - List roster saves in a directory
  #help                            - Show this help
  #quit                            - Exit";

/// Split a command into whitespace tokens (keeping `"quoted strings"`
/// together) and an optional trailing JSON object.
fn split_command(line: &str) -> (Vec<String>, Option<&str>) {
    let (head, json) = match line.find('{') {
        Some(at) => (&line[..at], Some(&line[at..])),
        None => (line, None),
    };
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut started = false;
    for ch in head.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                started = true;
            }
            c if c.is_whitespace() && !quoted => {
                if started {
                    tokens.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }
    if started {
        tokens.push(current);
    }
    (tokens, json)
}

fn parse_period(s: &str) -> Option<RestPeriod> {
    match s.to_lowercase().as_str() {
        "encounter" | "short" => Some(RestPeriod::Encounter),
        "day" | "long" => Some(RestPeriod::Day),
        "week" => Some(RestPeriod::Week),
        _ => None,
    }
}

/// The default roster when no save is given.
pub fn sample_roster() -> Vec<Actor> {
    vec![sample_fighter("Val"), sample_archer("Ash"), sample_wizard("Ilse")]
}

/// Executes protocol commands against one engine.
pub struct Driver {
    engine: Engine,
    user: User,
}

impl Driver {
    pub fn new(engine: Engine, user: User) -> Self {
        Self { engine, user }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    async fn actor(&self, name: &str) -> Result<(ActorId, Actor), String> {
        let store = self.engine.store();
        let id = store
            .find_by_name(name)
            .await
            .ok_or_else(|| format!("No actor named {name}"))?;
        let actor = store.get(id).await.map_err(|e| e.to_string())?;
        Ok((id, actor))
    }

    pub async fn handle(&self, line: &str) -> Reply {
        let line = line.trim();
        let Some(command) = line.strip_prefix('#') else {
            return Reply::Error("Commands start with '#'. Type #help for help.".to_string());
        };
        let (tokens, json) = split_command(command);
        let Some((verb, args)) = tokens.split_first() else {
            return Reply::Error("Empty command".to_string());
        };
        debug!(%verb, ?args, "headless command");

        match verb.as_str() {
            "quit" | "exit" => Reply::Quit,
            "help" => Reply::Text(format!("[HELP]\n{HELP}")),
            "actors" => self.actors().await,
            "status" => match args.first() {
                Some(name) => self.status(name).await,
                None => Reply::Error("Usage: #status <actor>".to_string()),
            },
            "use" | "full" => match args {
                [actor, entity, rest @ ..] => self.invoke(actor, entity, rest, json, verb == "full").await,
                _ => Reply::Error(format!("Usage: #{verb} <actor> <entity> [k=v] [{{json}}]")),
            },
            "recharge" => match args {
                [actor, entity, amount] => match amount.parse::<i64>() {
                    Ok(amount) => self.recharge(actor, entity, amount).await,
                    Err(_) => Reply::Error(format!("Not a number: {amount}")),
                },
                _ => Reply::Error("Usage: #recharge <actor> <entity> <n>".to_string()),
            },
            "rest" => match args {
                [actor, period] => match parse_period(period) {
                    Some(period) => self.rest(actor, period).await,
                    None => Reply::Error(format!("Unknown rest period: {period}")),
                },
                _ => Reply::Error("Usage: #rest <actor> encounter|day|week".to_string()),
            },
            "save" => match args.first() {
                Some(path) => {
                    let saved = SavedRoster::from_store("roster", self.engine.store()).await;
                    match saved.save_json(path).await {
                        Ok(()) => Reply::Text(format!("[SAVED] Roster saved to {path}")),
                        Err(e) => Reply::Error(format!("Save failed: {e}")),
                    }
                }
                None => Reply::Error("Usage: #save <path>".to_string()),
            },
            "load" => match args.first() {
                Some(path) => match SavedRoster::load_json(path).await {
                    Ok(saved) => {
                        let count = saved.actors.len();
                        saved.restore(self.engine.store()).await;
                        Reply::Text(format!("[LOADED] {count} actors from {path}"))
                    }
                    Err(e) => Reply::Error(format!("Load failed: {e}")),
                },
                None => Reply::Error("Usage: #load <path>".to_string()),
            },
            "saves" => match args.first() {
                Some(dir) => match persist::list_saves(dir).await {
                    Ok(saves) => Reply::Json(Value::Array(
                        saves
                            .iter()
                            .map(|s| {
                                json!({
                                    "path": s.path.display().to_string(),
                                    "name": s.metadata.name,
                                    "actors": s.metadata.actor_names,
                                })
                            })
                            .collect(),
                    )),
                    Err(e) => Reply::Error(format!("Could not list saves: {e}")),
                },
                None => Reply::Error("Usage: #saves <dir>".to_string()),
            },
            _ => Reply::Error("Unknown command. Type #help for help.".to_string()),
        }
    }

    async fn actors(&self) -> Reply {
        let roster: Vec<Value> = self
            .engine
            .store()
            .roster()
            .await
            .iter()
            .map(|a| {
                json!({
                    "name": a.name,
                    "id": a.id.to_string(),
                    "hp": format!("{}/{}", a.hit_points.current, a.hit_points.maximum),
                    "entities": a.entities.len(),
                })
            })
            .collect();
        Reply::Json(Value::Array(roster))
    }

    async fn status(&self, name: &str) -> Reply {
        let actor = match self.actor(name).await {
            Ok((_, actor)) => actor,
            Err(e) => return Reply::Error(e),
        };
        let entities: Vec<Value> = actor
            .entities
            .iter()
            .map(|e| {
                let mut entry = json!({ "name": e.name, "kind": e.kind.as_str() });
                if e.is_charged() {
                    entry["uses"] = json!(format!("{}/{}", e.uses.state.value, e.uses.state.max));
                }
                if let Some(quantity) = e.quantity {
                    entry["quantity"] = json!(quantity);
                }
                if let Some(spell) = &e.spell {
                    entry["prepared"] = json!(format!("{}/{}", spell.prepared, spell.max_prepared));
                }
                entry
            })
            .collect();
        let books: Value = actor
            .spellbooks
            .iter()
            .map(|(key, book)| {
                let slots: Value = book
                    .slots
                    .iter()
                    .map(|(level, s)| (level.to_string(), json!(format!("{}/{}", s.value, s.max))))
                    .collect::<serde_json::Map<_, _>>()
                    .into();
                (key.clone(), json!({ "cl": book.caster_level, "slots": slots }))
            })
            .collect::<serde_json::Map<_, _>>()
            .into();
        Reply::Json(json!({
            "name": actor.name,
            "hp": format!("{}/{}", actor.hit_points.current, actor.hit_points.maximum),
            "conditions": actor.conditions,
            "entities": entities,
            "spellbooks": books,
        }))
    }

    async fn invoke(&self, actor: &str, entity: &str, pairs: &[String], json: Option<&str>, full: bool) -> Reply {
        let (actor_id, snapshot) = match self.actor(actor).await {
            Ok(found) => found,
            Err(e) => return Reply::Error(e),
        };
        let Some(entity_id) = snapshot.find_entity(entity, None).map(|e| e.id) else {
            return Reply::Error(format!("{actor} has no {entity}"));
        };

        let mut options = match json {
            Some(text) => match serde_json::from_str::<InvocationOptions>(text) {
                Ok(options) => options,
                Err(e) => return Reply::Error(format!("Bad options: {e}")),
            },
            None => InvocationOptions::new(),
        };
        options.full_attack |= full;
        for pair in pairs {
            let Some((key, value)) = pair.split_once('=') else {
                return Reply::Error(format!("Expected key=value, got {pair}"));
            };
            let named = |name: &str| snapshot.find_entity(name, None).map(|e| e.id);
            let number = || value.parse::<i64>().map_err(|_| format!("Not a number: {value}"));
            let applied = match key {
                "ammo" => named(value)
                    .map(|id| options.ammunition = Some(id))
                    .ok_or_else(|| format!("{actor} has no {value}")),
                "source" => named(value)
                    .map(|id| options.optional_sources.push(OptionalSelection::new(id)))
                    .ok_or_else(|| format!("{actor} has no {value}")),
                "power" => number().map(|n| options.power_attack = Some(n)),
                "amount" => number().map(|n| options.use_amount = n),
                "ac" => number().map(|n| options.target_ac = Some(n)),
                other => Err(format!("Unknown option {other}")),
            };
            if let Err(e) = applied {
                return Reply::Error(e);
            }
        }

        match self.engine.invoke(&self.user, actor_id, entity_id, &options).await {
            Ok(bundle) => {
                info!(actor = %bundle.actor, entity = %bundle.entity, damage = bundle.total_damage(), "invocation complete");
                Reply::json(&bundle)
            }
            Err(e) => Reply::Error(e.to_string()),
        }
    }

    async fn recharge(&self, actor: &str, entity: &str, amount: i64) -> Reply {
        let (id, snapshot) = match self.actor(actor).await {
            Ok(found) => found,
            Err(e) => return Reply::Error(e),
        };
        let Some(entity_id) = snapshot.find_entity(entity, None).map(|e| e.id) else {
            return Reply::Error(format!("{actor} has no {entity}"));
        };
        match self.engine.store().recharge(id, entity_id, amount).await {
            Ok(restored) => Reply::Text(format!("[RECHARGED] {entity}: +{restored}")),
            Err(e) => Reply::Error(e.to_string()),
        }
    }

    async fn rest(&self, actor: &str, period: RestPeriod) -> Reply {
        let id = match self.actor(actor).await {
            Ok((id, _)) => id,
            Err(e) => return Reply::Error(e),
        };
        match self.engine.store().rest(id, period).await {
            Ok(count) => Reply::Text(format!("[RESTED] {actor}: {count} pools refreshed")),
            Err(e) => Reply::Error(e.to_string()),
        }
    }
}

/// Build the engine described by `config`.
pub async fn build_driver(config: &HeadlessConfig) -> Result<Driver, Box<dyn std::error::Error>> {
    let engine_config = match &config.config {
        Some(path) => EngineConfig::load(path).await?,
        None => EngineConfig::default(),
    };
    let mut actors = match &config.roster {
        Some(path) => SavedRoster::load_json(path).await?.actors,
        None => sample_roster(),
    };
    let user = match &config.player {
        Some(name) => {
            let user = User::player(name.clone());
            let mut controlled = 0;
            for actor in actors.iter_mut().filter(|a| a.name.eq_ignore_ascii_case(name)) {
                actor.owners.push(user.id);
                controlled += 1;
            }
            if controlled == 0 {
                return Err(format!("no actor named {name} for --player").into());
            }
            user
        }
        None => User::gm("GM"),
    };
    let mut engine = Engine::new(ActorStore::from_actors(actors), engine_config);
    if let Some(seed) = config.seed {
        engine = engine.with_roller(SeededRoller::new(seed));
    }
    Ok(Driver::new(engine, user))
}

/// Run the engine in headless mode until `#quit` or end of input.
pub async fn run_headless(config: HeadlessConfig) -> Result<(), Box<dyn std::error::Error>> {
    let driver = build_driver(&config).await?;

    println!("=== d20 Headless Mode ===");
    for actor in driver.engine().store().roster().await {
        println!("Actor: {} ({} entities)", actor.name, actor.entities.len());
    }
    println!();
    println!("Commands:");
    println!("{HELP}");
    println!();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match driver.handle(&line).await {
            Reply::Quit => {
                println!("Goodbye!");
                break;
            }
            Reply::Text(text) => println!("{text}"),
            Reply::Json(value) => {
                println!("[RESULT]");
                match serde_json::to_string_pretty(&value) {
                    Ok(text) => println!("{text}"),
                    Err(e) => println!("[ERROR] {e}"),
                }
            }
            Reply::Error(e) => println!("[ERROR] {e}"),
        }
        stdout.flush().ok();
    }

    Ok(())
}

/// Parse startup options from command line arguments.
pub fn parse_config_from_args(args: &[String]) -> HeadlessConfig {
    let mut config = HeadlessConfig::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--roster" => {
                if let Some(path) = args.get(i + 1) {
                    config.roster = Some(PathBuf::from(path));
                    i += 1;
                }
            }
            "--config" => {
                if let Some(path) = args.get(i + 1) {
                    config.config = Some(PathBuf::from(path));
                    i += 1;
                }
            }
            "--seed" => {
                if let Some(seed) = args.get(i + 1) {
                    config.seed = seed.parse().ok();
                    i += 1;
                }
            }
            "--player" => {
                if let Some(name) = args.get(i + 1) {
                    config.player = Some(name.clone());
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn driver() -> Driver {
        build_driver(&HeadlessConfig {
            seed: Some(7),
            ..HeadlessConfig::default()
        })
        .await
        .unwrap()
    }

    fn json(reply: Reply) -> Value {
        match reply {
            Reply::Json(value) => value,
            other => panic!("expected JSON, got {other:?}"),
        }
    }

    #[test]
    fn test_split_command() {
        let (tokens, json) = split_command(r#"use Ilse "Magic Missile" amount=2 {"target_ac": 15}"#);
        assert_eq!(tokens, vec!["use", "Ilse", "Magic Missile", "amount=2"]);
        assert_eq!(json, Some(r#"{"target_ac": 15}"#));
    }

    #[test]
    fn test_parse_config_from_args() {
        let args: Vec<String> = ["d20", "--seed", "42", "--player", "Ana", "--roster", "party.json"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let config = parse_config_from_args(&args);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.player.as_deref(), Some("Ana"));
        assert_eq!(config.roster, Some(PathBuf::from("party.json")));
    }

    #[tokio::test]
    async fn test_use_prints_bundle() {
        let driver = driver().await;
        let bundle = json(driver.handle("#full Val Longsword power=2").await);
        assert_eq!(bundle["entity"], "Longsword");
        assert_eq!(bundle["sub_attacks"].as_array().unwrap().len(), 2);
        assert!(bundle["labels"]
            .as_array()
            .unwrap()
            .contains(&json!("Power Attack 2")));
    }

    #[tokio::test]
    async fn test_ammo_and_status() {
        let driver = driver().await;
        json(driver.handle("#use Ash Longbow ammo=Arrows").await);
        let status = json(driver.handle("#status Ash").await);
        let arrows = status["entities"]
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["name"] == "Arrows")
            .unwrap();
        assert_eq!(arrows["quantity"], 19);
    }

    #[tokio::test]
    async fn test_rest_recharges_spells() {
        let driver = driver().await;
        json(driver.handle("#use Ilse \"Magic Missile\"").await);
        json(driver.handle("#use Ilse \"Magic Missile\"").await);
        assert!(matches!(driver.handle("#use Ilse \"Magic Missile\"").await, Reply::Error(_)));
        assert!(matches!(driver.handle("#rest Ilse day").await, Reply::Text(_)));
        json(driver.handle("#use Ilse \"Magic Missile\"").await);
    }

    #[tokio::test]
    async fn test_player_controls_only_their_actor() {
        let driver = build_driver(&HeadlessConfig {
            player: Some("Val".to_string()),
            ..HeadlessConfig::default()
        })
        .await
        .unwrap();
        let bundle = json(driver.handle("#use Val Longsword").await);
        assert_eq!(bundle["entity"], "Longsword");
        match driver.handle("#use Ash Longbow ammo=Arrows").await {
            Reply::Error(e) => assert!(e.contains("may not act")),
            other => panic!("expected permission error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_player_is_rejected() {
        let result = build_driver(&HeadlessConfig {
            player: Some("Ana".to_string()),
            ..HeadlessConfig::default()
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("party.json");
        let path = path.to_string_lossy();

        let driver = driver().await;
        json(driver.handle("#use Ilse \"Wand of Magic Missile\" amount=5").await);
        assert!(matches!(driver.handle(&format!("#save {path}")).await, Reply::Text(_)));
        driver.handle("#recharge Ilse \"Wand of Magic Missile\" 5").await;
        assert!(matches!(driver.handle(&format!("#load {path}")).await, Reply::Text(_)));

        let status = json(driver.handle("#status Ilse").await);
        let wand = status["entities"]
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["name"] == "Wand of Magic Missile")
            .unwrap();
        assert_eq!(wand["uses"], "45/50");
    }

    #[tokio::test]
    async fn test_errors() {
        let driver = driver().await;
        assert!(matches!(driver.handle("attack!").await, Reply::Error(_)));
        assert!(matches!(driver.handle("#use Nobody Sword").await, Reply::Error(_)));
        assert!(matches!(driver.handle("#use Val Longsword power=lots").await, Reply::Error(_)));
        assert!(matches!(driver.handle("#rest Val fortnight").await, Reply::Error(_)));
        assert_eq!(driver.handle("#quit").await, Reply::Quit);
    }
}
