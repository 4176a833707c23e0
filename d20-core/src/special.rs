//! Scripted side effects attached to entities and modifier rules.
//!
//! A [`SpecialAction`] is a named list of [`Clause`]s, each a typed
//! [`Directive`] aimed at the acting actor or at the target. Actions are
//! authored as structured JSON; the older one-line text form is accepted
//! on deserialization and parsed into the same tree:
//!
//! ```text
//! Activate buff "Power Attack" on self; Condition set prone to true on target if @bab > 5
//! ```
//!
//! `self` clauses are applied to the acting actor during the engine's
//! commit. `target` clauses are returned to the caller unapplied.

use crate::actor::Actor;
use crate::catalog;
use crate::context::{number_value, RollContext};
use crate::dice::DiceRoller;
use crate::entity::EntityKind;
use crate::formula::{self, FormulaError, Roll};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SpecialActionError {
    #[error("Malformed special action clause: {0}")]
    Malformed(String),
    #[error("Unknown special action verb: {0}")]
    UnknownVerb(String),
    #[error("No entity named {0}")]
    MissingEntity(String),
    #[error("Cannot set field {path}: {reason}")]
    InvalidField { path: String, reason: String },
    #[error(transparent)]
    Formula(#[from] FormulaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTarget {
    #[serde(rename = "self")]
    SelfActor,
    Target,
}

/// Which owned entities a `Set` directive touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntitySelector {
    #[serde(default)]
    pub kind: Option<EntityKind>,
    #[serde(default)]
    pub subtype: Option<String>,
    /// `None` selects every entity matching kind and subtype.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum Directive {
    Create {
        name: String,
        #[serde(default)]
        pack: Option<String>,
        #[serde(default)]
        unique: bool,
    },
    Activate {
        #[serde(default)]
        kind: Option<EntityKind>,
        name: String,
    },
    Deactivate {
        #[serde(default)]
        kind: Option<EntityKind>,
        name: String,
    },
    SetField {
        selector: EntitySelector,
        path: String,
        value: String,
    },
    SetCondition {
        name: String,
        value: bool,
    },
    ToggleCondition {
        name: String,
    },
    Update {
        path: String,
        value: String,
    },
    Clear {
        kind: EntityKind,
        #[serde(default)]
        subtype: Option<String>,
    },
    Damage {
        formula: String,
    },
    Heal {
        formula: String,
    },
    Roll {
        formula: String,
    },
    Use {
        name: String,
        #[serde(default)]
        count: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub target: ActionTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(flatten)]
    pub directive: Directive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SpecialActionRepr")]
pub struct SpecialAction {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub clauses: Vec<Clause>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SpecialActionRepr {
    Text(String),
    Structured {
        #[serde(default)]
        name: String,
        #[serde(default)]
        condition: Option<String>,
        clauses: Vec<Clause>,
    },
    Legacy {
        #[serde(default)]
        name: String,
        #[serde(default)]
        condition: Option<String>,
        action: String,
    },
}

impl TryFrom<SpecialActionRepr> for SpecialAction {
    type Error = SpecialActionError;

    fn try_from(repr: SpecialActionRepr) -> Result<Self, Self::Error> {
        match repr {
            SpecialActionRepr::Text(text) => Ok(SpecialAction {
                name: text.clone(),
                condition: None,
                clauses: parse_legacy(&text)?,
            }),
            SpecialActionRepr::Structured {
                name,
                condition,
                clauses,
            } => Ok(SpecialAction {
                name,
                condition,
                clauses,
            }),
            SpecialActionRepr::Legacy {
                name,
                condition,
                action,
            } => Ok(SpecialAction {
                name,
                condition: condition.filter(|c| !c.trim().is_empty()),
                clauses: parse_legacy(&action)?,
            }),
        }
    }
}

impl SpecialAction {
    pub fn new(name: impl Into<String>, clauses: Vec<Clause>) -> Self {
        Self {
            name: name.into(),
            condition: None,
            clauses,
        }
    }

    /// Build from legacy text, naming the action after the text itself.
    pub fn parse(text: &str) -> Result<Self, SpecialActionError> {
        SpecialActionRepr::Text(text.to_string()).try_into()
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

// ============================================================================
// Legacy text grammar
// ============================================================================

/// Split parameters on whitespace, keeping `"quoted strings"` together and
/// dropping the quotes.
fn split_params(body: &str) -> Vec<String> {
    let mut params = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut started = false;
    for ch in body.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                started = true;
            }
            c if c.is_whitespace() && !quoted => {
                if started {
                    params.push(std::mem::take(&mut current));
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
        params.push(current);
    }
    params
}

/// Split off a trailing ` if <condition>`, ignoring ` if ` inside quotes.
fn split_condition(group: &str) -> Option<(&str, &str)> {
    let mut quoted = false;
    for (i, ch) in group.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ' ' if !quoted && group[i..].starts_with(" if ") => {
                return Some((&group[..i], &group[i + " if ".len()..]));
            }
            _ => {}
        }
    }
    None
}

/// Parse `<Verb> <params> on (self|target)[ if <condition>]` clauses
/// separated by `;`.
pub fn parse_legacy(text: &str) -> Result<Vec<Clause>, SpecialActionError> {
    let mut clauses = Vec::new();
    for group in text.split(';') {
        if group.trim().is_empty() {
            continue;
        }
        let (body, condition) = match split_condition(group) {
            Some((body, condition)) => (body, Some(condition.trim().to_string())),
            None => (group, None),
        };
        let body = body.trim();
        let (head, target) = if let Some(head) = body.strip_suffix(" on self") {
            (head, ActionTarget::SelfActor)
        } else if let Some(head) = body.strip_suffix(" on target") {
            (head, ActionTarget::Target)
        } else {
            return Err(SpecialActionError::Malformed(group.trim().to_string()));
        };
        let (verb, rest) = head
            .split_once(char::is_whitespace)
            .ok_or_else(|| SpecialActionError::Malformed(group.trim().to_string()))?;
        if verb.is_empty() || !verb.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(SpecialActionError::Malformed(group.trim().to_string()));
        }
        let params = split_params(rest);
        let directive = directive_from(verb, &params, group.trim())?;
        clauses.push(Clause {
            target,
            condition,
            directive,
        });
    }
    Ok(clauses)
}

fn parse_kind(text: &str) -> (Option<EntityKind>, Option<String>) {
    match text.split_once(':') {
        Some((kind, subtype)) => (EntityKind::from_name(kind), Some(subtype.to_string())),
        None => (EntityKind::from_name(text), None),
    }
}

fn directive_from(verb: &str, p: &[String], raw: &str) -> Result<Directive, SpecialActionError> {
    let malformed = || SpecialActionError::Malformed(raw.to_string());
    let p: Vec<&str> = p.iter().map(String::as_str).collect();
    let directive = match (verb.to_ascii_lowercase().as_str(), p.as_slice()) {
        ("create" | "give", [name]) => Directive::Create {
            name: name.to_string(),
            pack: None,
            unique: false,
        },
        ("create" | "give", [name, "from", pack]) => Directive::Create {
            name: name.to_string(),
            pack: Some(pack.to_string()),
            unique: false,
        },
        ("create" | "give", ["unique" | "u", name, "from", pack]) => Directive::Create {
            name: name.to_string(),
            pack: Some(pack.to_string()),
            unique: true,
        },
        ("activate", [name]) => Directive::Activate {
            kind: None,
            name: name.to_string(),
        },
        ("activate", [kind, name]) => Directive::Activate {
            kind: Some(EntityKind::from_name(kind).ok_or_else(malformed)?),
            name: name.to_string(),
        },
        ("deactivate", [name]) => Directive::Deactivate {
            kind: None,
            name: name.to_string(),
        },
        ("deactivate", [kind, name]) => Directive::Deactivate {
            kind: Some(EntityKind::from_name(kind).ok_or_else(malformed)?),
            name: name.to_string(),
        },
        ("set", [name, "field", path, "to", value]) => Directive::SetField {
            selector: EntitySelector {
                kind: None,
                subtype: None,
                name: Some(name.to_string()),
            },
            path: path.to_string(),
            value: value.to_string(),
        },
        ("set", [kind, name, "field", path, "to", value]) => {
            let (kind, subtype) = parse_kind(kind);
            Directive::SetField {
                selector: EntitySelector {
                    kind: Some(kind.ok_or_else(malformed)?),
                    subtype,
                    name: (*name != "*").then(|| name.to_string()),
                },
                path: path.to_string(),
                value: value.to_string(),
            }
        }
        ("condition", ["set", name, "to", value]) => Directive::SetCondition {
            name: name.to_string(),
            value: *value == "true",
        },
        ("condition", ["toggle", name]) => Directive::ToggleCondition {
            name: name.to_string(),
        },
        ("update", ["set", path, "to", value]) => Directive::Update {
            path: path.to_string(),
            value: value.to_string(),
        },
        ("clear", [kind]) | ("clear", [kind, _]) => {
            let (kind, subtype) = parse_kind(kind);
            Directive::Clear {
                kind: kind.ok_or_else(malformed)?,
                subtype: subtype.or_else(|| p.get(1).map(|s| s.to_string())),
            }
        }
        ("damage", formula) if !formula.is_empty() => Directive::Damage {
            formula: formula.join(" "),
        },
        ("heal", formula) if !formula.is_empty() => Directive::Heal {
            formula: formula.join(" "),
        },
        ("roll", formula) if !formula.is_empty() => Directive::Roll {
            formula: formula.join(" "),
        },
        ("use", [name]) => Directive::Use {
            name: name.to_string(),
            count: None,
        },
        ("use", [name, count]) => Directive::Use {
            name: name.to_string(),
            count: Some(count.to_string()),
        },
        (
            "create" | "give" | "activate" | "deactivate" | "set" | "condition" | "update" | "clear"
            | "damage" | "heal" | "roll" | "use",
            _,
        ) => return Err(malformed()),
        _ => return Err(SpecialActionError::UnknownVerb(verb.to_string())),
    };
    Ok(directive)
}

// ============================================================================
// Application
// ============================================================================

/// What applying a `self` clause did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AppliedAction {
    Created { name: String },
    Activated { name: String },
    Deactivated { name: String },
    FieldSet { entity: String, path: String, value: Value },
    ConditionSet { name: String, value: bool },
    Updated { path: String, value: Value },
    Cleared { count: usize },
    Damaged { amount: i64 },
    Healed { amount: i64 },
    Rolled { roll: Roll },
    /// Using another entity is a separate invocation left to the caller.
    UseRequested { name: String, count: i64 },
    Skipped { reason: String },
}

/// Whether the clause's condition (if any) holds. Malformed conditions
/// are logged and treated as false.
pub fn condition_holds(condition: Option<&str>, ctx: &RollContext) -> bool {
    match condition.map(str::trim).filter(|c| !c.is_empty()) {
        None => true,
        Some(source) => formula::evaluate_condition(source, ctx).unwrap_or_else(|err| {
            warn!(condition = source, error = %err, "special action condition failed");
            false
        }),
    }
}

fn literal_value(raw: &str, ctx: &RollContext) -> Result<Value, FormulaError> {
    match raw {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        _ => Ok(number_value(formula::Formula::parse(raw)?.compute_exact(ctx)?)),
    }
}

fn set_json_path(root: &mut Value, path: &str, value: Value) -> Result<(), String> {
    let path = path.strip_prefix("data.").unwrap_or(path);
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().ok_or("empty path")?;
    let mut current = root;
    for segment in segments {
        current = current
            .get_mut(segment)
            .ok_or_else(|| format!("no field {segment}"))?;
    }
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        _ => Err(format!("{path} is not inside an object")),
    }
}

/// Round-trip `item` through JSON to set one field by path.
fn set_field<T>(item: &T, path: &str, value: Value) -> Result<T, SpecialActionError>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    let invalid = |reason: String| SpecialActionError::InvalidField {
        path: path.to_string(),
        reason,
    };
    let mut json = serde_json::to_value(item).map_err(|e| invalid(e.to_string()))?;
    set_json_path(&mut json, path, value).map_err(invalid)?;
    serde_json::from_value(json).map_err(|e| invalid(e.to_string()))
}

impl Directive {
    /// Apply to the acting actor.
    pub fn apply(
        &self,
        actor: &mut Actor,
        ctx: &RollContext,
        roller: &mut dyn DiceRoller,
    ) -> Result<AppliedAction, SpecialActionError> {
        let applied = match self {
            Directive::Create { name, unique, .. } => {
                if *unique && actor.find_entity(name, None).is_some() {
                    AppliedAction::Skipped {
                        reason: format!("{name} already present"),
                    }
                } else {
                    let entity = catalog::instantiate(name)
                        .ok_or_else(|| SpecialActionError::MissingEntity(name.clone()))?;
                    actor.entities.push(entity);
                    AppliedAction::Created { name: name.clone() }
                }
            }
            Directive::Activate { kind, name } => {
                let entity = actor
                    .entities
                    .iter_mut()
                    .find(|e| e.name == *name && kind.map_or(true, |k| e.kind == k))
                    .ok_or_else(|| SpecialActionError::MissingEntity(name.clone()))?;
                if entity.kind == EntityKind::Buff {
                    entity.active = true;
                    AppliedAction::Activated { name: name.clone() }
                } else {
                    AppliedAction::UseRequested {
                        name: name.clone(),
                        count: 1,
                    }
                }
            }
            Directive::Deactivate { kind, name } => {
                let entity = actor
                    .entities
                    .iter_mut()
                    .find(|e| e.name == *name && kind.map_or(true, |k| e.kind == k))
                    .ok_or_else(|| SpecialActionError::MissingEntity(name.clone()))?;
                entity.active = false;
                AppliedAction::Deactivated { name: name.clone() }
            }
            Directive::SetField {
                selector,
                path,
                value,
            } => {
                let value = literal_value(value, ctx)?;
                // Stage every rewrite first; a failure leaves all matches untouched.
                let mut rewritten = Vec::new();
                for (index, entity) in actor.entities.iter().enumerate().filter(|(_, e)| {
                    selector.kind.map_or(true, |k| e.kind == k)
                        && selector.subtype.as_ref().map_or(true, |s| e.subtype == *s)
                        && selector.name.as_ref().map_or(true, |n| e.name == *n)
                }) {
                    rewritten.push((index, set_field(entity, path, value.clone())?));
                }
                let mut touched = Vec::with_capacity(rewritten.len());
                for (index, entity) in rewritten {
                    touched.push(entity.name.clone());
                    actor.entities[index] = entity;
                }
                if touched.is_empty() {
                    return Err(SpecialActionError::MissingEntity(
                        selector.name.clone().unwrap_or_else(|| "*".to_string()),
                    ));
                }
                AppliedAction::FieldSet {
                    entity: touched.join(", "),
                    path: path.clone(),
                    value,
                }
            }
            Directive::SetCondition { name, value } => {
                actor.conditions.insert(name.clone(), *value);
                AppliedAction::ConditionSet {
                    name: name.clone(),
                    value: *value,
                }
            }
            Directive::ToggleCondition { name } => {
                let value = !actor.condition(name);
                actor.conditions.insert(name.clone(), value);
                AppliedAction::ConditionSet {
                    name: name.clone(),
                    value,
                }
            }
            Directive::Update { path, value } => {
                let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.clone()));
                *actor = set_field(&*actor, path, value.clone())?;
                AppliedAction::Updated {
                    path: path.clone(),
                    value,
                }
            }
            Directive::Clear { kind, subtype } => {
                let before = actor.entities.len();
                actor.entities.retain(|e| {
                    !(e.kind == *kind && subtype.as_ref().map_or(true, |s| e.subtype == *s))
                });
                AppliedAction::Cleared {
                    count: before - actor.entities.len(),
                }
            }
            Directive::Damage { formula } => {
                let roll = formula::roll(formula, ctx, roller)?;
                AppliedAction::Damaged {
                    amount: actor.hit_points.take_damage(roll.total),
                }
            }
            Directive::Heal { formula } => {
                let roll = formula::roll(formula, ctx, roller)?;
                AppliedAction::Healed {
                    amount: actor.hit_points.heal(roll.total),
                }
            }
            Directive::Roll { formula } => AppliedAction::Rolled {
                roll: formula::roll(formula, ctx, roller)?,
            },
            Directive::Use { name, count } => {
                let count = match count {
                    Some(source) => formula::compute(source, ctx)?,
                    None => 1,
                };
                AppliedAction::UseRequested {
                    name: name.clone(),
                    count,
                }
            }
        };
        debug!(actor = %actor.name, ?applied, "special action applied");
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ActionableEntity;
    use crate::testing::ScriptedRoller;
    use serde_json::json;

    #[test]
    fn test_parse_legacy_clauses() {
        let clauses = parse_legacy(
            "Activate buff \"Power Attack\" on self; Condition set prone to true on target if @bab > 5",
        )
        .unwrap();
        assert_eq!(clauses.len(), 2);
        assert_eq!(
            clauses[0],
            Clause {
                target: ActionTarget::SelfActor,
                condition: None,
                directive: Directive::Activate {
                    kind: Some(EntityKind::Buff),
                    name: "Power Attack".to_string()
                }
            }
        );
        assert_eq!(clauses[1].target, ActionTarget::Target);
        assert_eq!(clauses[1].condition.as_deref(), Some("@bab > 5"));
        assert_eq!(
            clauses[1].directive,
            Directive::SetCondition {
                name: "prone".to_string(),
                value: true
            }
        );
    }

    #[test]
    fn test_quoted_name_containing_if() {
        let clauses = parse_legacy("Activate buff \"Cover if Able\" on self if @bab > 2").unwrap();
        assert_eq!(
            clauses[0].directive,
            Directive::Activate {
                kind: Some(EntityKind::Buff),
                name: "Cover if Able".to_string()
            }
        );
        assert_eq!(clauses[0].condition.as_deref(), Some("@bab > 2"));

        let unconditional = parse_legacy("Activate buff \"Cover if Able\" on self").unwrap();
        assert_eq!(unconditional[0].condition, None);
        assert_eq!(unconditional[0].target, ActionTarget::SelfActor);
    }

    #[test]
    fn test_parse_set_and_create_forms() {
        let clauses = parse_legacy(
            "Set buff:spell * field data.level to @cl on self; Create unique \"Flame Blade\" from spells on self",
        )
        .unwrap();
        assert_eq!(
            clauses[0].directive,
            Directive::SetField {
                selector: EntitySelector {
                    kind: Some(EntityKind::Buff),
                    subtype: Some("spell".to_string()),
                    name: None
                },
                path: "data.level".to_string(),
                value: "@cl".to_string()
            }
        );
        assert_eq!(
            clauses[1].directive,
            Directive::Create {
                name: "Flame Blade".to_string(),
                pack: Some("spells".to_string()),
                unique: true
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_legacy("Activate Rage"),
            Err(SpecialActionError::Malformed(_))
        ));
        assert!(matches!(
            parse_legacy("Explode everything on self"),
            Err(SpecialActionError::UnknownVerb(v)) if v == "Explode"
        ));
        assert!(matches!(
            parse_legacy("Condition set prone on self"),
            Err(SpecialActionError::Malformed(_))
        ));
    }

    #[test]
    fn test_deserialize_legacy_and_structured() {
        let legacy: SpecialAction = serde_json::from_value(json!({
            "name": "Rage",
            "action": "Activate buff Rage on self",
            "condition": ""
        }))
        .unwrap();
        assert_eq!(legacy.name, "Rage");
        assert_eq!(legacy.condition, None);
        assert_eq!(legacy.clauses.len(), 1);

        let structured: SpecialAction = serde_json::from_value(serde_json::to_value(&legacy).unwrap()).unwrap();
        assert_eq!(structured, legacy);

        let text: SpecialAction = serde_json::from_value(json!("Condition toggle fatigued on self")).unwrap();
        assert_eq!(text.clauses[0].directive, Directive::ToggleCondition { name: "fatigued".into() });

        assert!(serde_json::from_value::<SpecialAction>(json!("nonsense")).is_err());
    }

    #[test]
    fn test_apply_directives() {
        let mut actor = Actor::new("Barbarian")
            .with_hit_points(20)
            .with_entity(ActionableEntity::new("Rage", EntityKind::Buff));
        let mut ctx = RollContext::new();
        ctx.set("cl", 4);
        let mut roller = ScriptedRoller::new(vec![3]);

        let applied = Directive::Activate {
            kind: Some(EntityKind::Buff),
            name: "Rage".into(),
        }
        .apply(&mut actor, &ctx, &mut roller)
        .unwrap();
        assert_eq!(applied, AppliedAction::Activated { name: "Rage".into() });
        assert!(actor.find_entity("Rage", None).unwrap().active);

        Directive::SetField {
            selector: EntitySelector {
                kind: Some(EntityKind::Buff),
                subtype: None,
                name: Some("Rage".into()),
            },
            path: "data.enhancement".into(),
            value: "@cl / 2".into(),
        }
        .apply(&mut actor, &ctx, &mut roller)
        .unwrap();
        assert_eq!(actor.find_entity("Rage", None).unwrap().enhancement, 2);

        let damaged = Directive::Damage { formula: "1d6 + 1".into() }
            .apply(&mut actor, &ctx, &mut roller)
            .unwrap();
        assert_eq!(damaged, AppliedAction::Damaged { amount: 4 });
        assert_eq!(actor.hit_points.current, 16);

        Directive::ToggleCondition { name: "fatigued".into() }
            .apply(&mut actor, &ctx, &mut roller)
            .unwrap();
        assert!(actor.condition("fatigued"));

        Directive::Update {
            path: "is_npc".into(),
            value: "true".into(),
        }
        .apply(&mut actor, &ctx, &mut roller)
        .unwrap();
        assert!(actor.is_npc);
    }

    #[test]
    fn test_set_field_is_all_or_nothing() {
        let mut actor = Actor::new("Cleric")
            .with_entity(crate::testing::prepared_spell(
                ActionableEntity::new("Scroll", EntityKind::Equipment),
                1,
                3,
            ))
            .with_entity(ActionableEntity::new("Rope", EntityKind::Equipment));
        let before = actor.clone();
        let mut roller = ScriptedRoller::new(vec![]);

        let result = Directive::SetField {
            selector: EntitySelector {
                kind: Some(EntityKind::Equipment),
                subtype: None,
                name: None,
            },
            path: "spell.prepared".into(),
            value: "0".into(),
        }
        .apply(&mut actor, &RollContext::new(), &mut roller);
        assert!(matches!(result, Err(SpecialActionError::InvalidField { .. })));
        assert_eq!(actor, before);
    }

    #[test]
    fn test_create_from_catalog() {
        let mut actor = Actor::new("Fighter");
        let mut roller = ScriptedRoller::new(vec![]);
        let ctx = RollContext::new();
        let create = Directive::Create {
            name: "Longsword".into(),
            pack: None,
            unique: true,
        };
        assert_eq!(
            create.apply(&mut actor, &ctx, &mut roller).unwrap(),
            AppliedAction::Created { name: "Longsword".into() }
        );
        assert!(matches!(
            create.apply(&mut actor, &ctx, &mut roller).unwrap(),
            AppliedAction::Skipped { .. }
        ));
        assert!(matches!(
            Directive::Create { name: "Vorpal Spoon".into(), pack: None, unique: false }
                .apply(&mut actor, &ctx, &mut roller),
            Err(SpecialActionError::MissingEntity(_))
        ));
    }

    #[test]
    fn test_condition_holds() {
        let mut ctx = RollContext::new();
        ctx.set("bab", 6);
        assert!(condition_holds(None, &ctx));
        assert!(condition_holds(Some(""), &ctx));
        assert!(condition_holds(Some("@bab > 5"), &ctx));
        assert!(!condition_holds(Some("@bab >"), &ctx));
    }
}
