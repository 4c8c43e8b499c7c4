//! Process-wide mapping between stable class names and command types.
//!
//! Built once at startup from an explicit registration list and read-only
//! afterwards. Persisted rows only carry the class name, so everything needed
//! to turn a row back into a live command is looked up here.

use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    command::{Command, CommandRequest, CommandState, CommandType, ScheduledCommand},
    error::{RegistryError, Result},
    precondition::Precondition,
};

type DecodeFn = fn(&str) -> std::result::Result<Arc<dyn Command>, serde_json::Error>;
type EncodeFn = fn(&dyn Any) -> Option<std::result::Result<String, serde_json::Error>>;

fn decode<T: CommandType>(data: &str) -> std::result::Result<Arc<dyn Command>, serde_json::Error> {
    let command: T = serde_json::from_str(data)?;
    Ok(Arc::new(command))
}

fn encode<T: CommandType>(
    command: &dyn Any,
) -> Option<std::result::Result<String, serde_json::Error>> {
    command.downcast_ref::<T>().map(serde_json::to_string)
}

/// Registered command type.
#[derive(Clone)]
pub struct CommandClass {
    class_name: &'static str,
    type_name: &'static str,
    type_id: TypeId,
    decode: DecodeFn,
    encode: EncodeFn,
}

impl CommandClass {
    fn of<T: CommandType>() -> Self {
        Self {
            class_name: T::CLASS_NAME,
            type_name: type_name::<T>(),
            type_id: TypeId::of::<T>(),
            decode: decode::<T>,
            encode: encode::<T>,
        }
    }

    pub fn class_name(&self) -> &'static str {
        self.class_name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }
}

impl fmt::Debug for CommandClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandClass")
            .field("class_name", &self.class_name)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Why a persisted row could not be turned back into a command. Both cases
/// quarantine the row instead of retrying it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconstructError {
    #[error("command class `{class_name}` is not registered")]
    Unresolvable { class_name: String },

    #[error("payload for `{class_name}` could not be decoded: {reason}")]
    Payload { class_name: String, reason: String },
}

/// Immutable name/type tables for commands and preconditions.
pub struct CommandRegistry {
    by_name: HashMap<&'static str, CommandClass>,
    by_type: HashMap<TypeId, &'static str>,
    preconditions: HashMap<String, Arc<dyn Precondition>>,
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<_> = self.by_name.keys().collect();
        classes.sort();
        let mut preconditions: Vec<_> = self.preconditions.keys().collect();
        preconditions.sort();
        f.debug_struct("CommandRegistry")
            .field("classes", &classes)
            .field("preconditions", &preconditions)
            .finish()
    }
}

impl CommandRegistry {
    pub fn builder() -> CommandRegistryBuilder {
        CommandRegistryBuilder::default()
    }

    /// Looks up a class by its persisted name. `None` when the type is gone,
    /// e.g. after an upgrade removed it.
    pub fn resolve(&self, class_name: &str) -> Option<&CommandClass> {
        self.by_name.get(class_name)
    }

    pub fn class_name_of(&self, command: &dyn Command) -> Option<&'static str> {
        let any: &dyn Any = command;
        self.by_type.get(&Any::type_id(any)).copied()
    }

    pub fn precondition(&self, name: &str) -> Option<&Arc<dyn Precondition>> {
        self.preconditions.get(name)
    }

    /// Builds the persisted row for `command`.
    pub fn to_request(
        &self,
        command: &dyn Command,
        batch: Option<&str>,
        retries: u32,
        default_max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<CommandRequest> {
        let any: &dyn Any = command;
        let class_name = self
            .class_name_of(command)
            .ok_or_else(|| RegistryError::UnregisteredType(format!("{command:?}")))?;
        let class = self
            .by_name
            .get(class_name)
            .ok_or_else(|| RegistryError::UnregisteredType(class_name.to_owned()))?;

        for precondition in command.preconditions() {
            if !self.preconditions.contains_key(*precondition) {
                return Err(RegistryError::UnknownPrecondition {
                    command: class_name.to_owned(),
                    precondition: (*precondition).to_owned(),
                }
                .into());
            }
        }

        let data = (class.encode)(any)
            .ok_or_else(|| RegistryError::UnregisteredType(class_name.to_owned()))??;
        let max_retries = command.max_retries().unwrap_or(default_max_retries);

        Ok(CommandRequest {
            id: command.id(),
            class_name: class_name.to_owned(),
            work_type: command.work_type(),
            parallel_tag: command.parallel_tag(),
            parallel_max: command.parallel_max().map(|max| max.max(1)),
            priority: command.priority(),
            batch: batch.map(str::to_owned),
            retries: retries.min(max_retries),
            max_retries,
            preconditions: command
                .preconditions()
                .iter()
                .map(|name| (*name).to_owned())
                .collect(),
            data,
            description: command.pretty_description(),
            state: CommandState::Queued,
            available_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rebuilds the live command for a persisted row.
    pub fn to_command(
        &self,
        request: CommandRequest,
    ) -> std::result::Result<ScheduledCommand, ReconstructError> {
        let class = self
            .resolve(&request.class_name)
            .ok_or_else(|| ReconstructError::Unresolvable {
                class_name: request.class_name.clone(),
            })?;
        let command = (class.decode)(&request.data).map_err(|err| ReconstructError::Payload {
            class_name: request.class_name.clone(),
            reason: err.to_string(),
        })?;
        Ok(ScheduledCommand::new(request, command))
    }
}

/// Registration list consumed once by [`CommandRegistryBuilder::build`].
#[derive(Default)]
pub struct CommandRegistryBuilder {
    classes: Vec<CommandClass>,
    preconditions: Vec<(String, Arc<dyn Precondition>)>,
}

impl fmt::Debug for CommandRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistryBuilder")
            .field("class_count", &self.classes.len())
            .field("precondition_count", &self.preconditions.len())
            .finish()
    }
}

impl CommandRegistryBuilder {
    pub fn command<T: CommandType>(mut self) -> Self {
        self.classes.push(CommandClass::of::<T>());
        self
    }

    pub fn precondition(
        mut self,
        name: impl Into<String>,
        precondition: Arc<dyn Precondition>,
    ) -> Self {
        self.preconditions.push((name.into(), precondition));
        self
    }

    pub fn build(self) -> std::result::Result<CommandRegistry, RegistryError> {
        let mut by_name = HashMap::with_capacity(self.classes.len());
        let mut by_type = HashMap::with_capacity(self.classes.len());
        for class in self.classes {
            if by_name.contains_key(class.class_name) || by_type.contains_key(&class.type_id) {
                return Err(RegistryError::DuplicateClass(class.class_name.to_owned()));
            }
            by_type.insert(class.type_id, class.class_name);
            by_name.insert(class.class_name, class);
        }

        let mut preconditions = HashMap::with_capacity(self.preconditions.len());
        for (name, precondition) in self.preconditions {
            if preconditions.contains_key(&name) {
                return Err(RegistryError::DuplicatePrecondition(name));
            }
            preconditions.insert(name, precondition);
        }

        Ok(CommandRegistry {
            by_name,
            by_type,
            preconditions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{CommandId, WorkType},
        error::QueueError,
        testing::{GetAnimeFull, HashFile, Orphan, fixture_registry},
    };

    #[test]
    fn round_trip_preserves_scheduling_and_payload() {
        let registry = fixture_registry();
        let original = GetAnimeFull::new(12345);
        let now = Utc::now();

        let request = registry
            .to_request(&original, Some("import-7"), 1, 3, now)
            .expect("request");
        assert_eq!(request.class_name, "GetAnimeFull");
        assert_eq!(request.id, CommandId::new("GetAnimeFull_12345"));

        let rebuilt = registry.to_command(request.clone()).expect("rebuild");
        assert_eq!(rebuilt.class_name(), "GetAnimeFull");
        assert_eq!(rebuilt.parallel_tag(), "AniDB");
        assert_eq!(rebuilt.parallel_max(), Some(1));
        assert_eq!(rebuilt.priority(), 3);
        assert_eq!(rebuilt.retries(), 1);
        assert_eq!(rebuilt.batch(), Some("import-7"));
        assert_eq!(rebuilt.work_type(), WorkType::AniDb);

        let payload = rebuilt.downcast_ref::<GetAnimeFull>().expect("concrete type");
        assert_eq!(payload.anime_id, 12345);
        assert_eq!(payload.force_refresh, original.force_refresh);

        let again = registry
            .to_request(rebuilt.command().as_ref(), rebuilt.batch(), rebuilt.retries(), 3, now)
            .expect("second request");
        assert_eq!(again, request);
    }

    #[test]
    fn skipped_fields_stay_out_of_the_payload() {
        let registry = fixture_registry();
        let mut command = GetAnimeFull::new(7);
        command.cached_title = Some("Cowboy Bebop".into());

        let request = registry
            .to_request(&command, None, 0, 3, Utc::now())
            .expect("request");
        assert!(!request.data.contains("Cowboy Bebop"));

        let rebuilt = registry.to_command(request).expect("rebuild");
        let payload = rebuilt.downcast_ref::<GetAnimeFull>().expect("concrete type");
        assert_eq!(payload.cached_title, None);
    }

    #[test]
    fn unresolvable_class_is_reported_not_raised() {
        let registry = fixture_registry();
        let mut request = registry
            .to_request(&HashFile::new("/media/a.mkv"), None, 0, 3, Utc::now())
            .expect("request");
        request.class_name = "RemovedInUpgrade".into();

        assert!(registry.resolve("RemovedInUpgrade").is_none());
        assert_eq!(
            registry.to_command(request).expect_err("unresolvable"),
            ReconstructError::Unresolvable {
                class_name: "RemovedInUpgrade".into()
            }
        );
    }

    #[test]
    fn corrupt_payload_is_reported() {
        let registry = fixture_registry();
        let mut request = registry
            .to_request(&HashFile::new("/media/a.mkv"), None, 0, 3, Utc::now())
            .expect("request");
        request.data = "{not json".into();
        assert!(matches!(
            registry.to_command(request),
            Err(ReconstructError::Payload { .. })
        ));
    }

    #[test]
    fn retries_are_capped_by_the_budget() {
        let registry = fixture_registry();
        let request = registry
            .to_request(&HashFile::new("/media/a.mkv"), None, 9, 2, Utc::now())
            .expect("request");
        assert_eq!(request.max_retries, 2);
        assert_eq!(request.retries, 2);
    }

    #[test]
    fn duplicate_registrations_fail_the_build() {
        let err = CommandRegistry::builder()
            .command::<HashFile>()
            .command::<HashFile>()
            .build()
            .expect_err("duplicate");
        assert_eq!(err, RegistryError::DuplicateClass("HashFile".into()));
    }

    #[test]
    fn unregistered_types_and_preconditions_are_rejected() {
        let registry = CommandRegistry::builder()
            .command::<GetAnimeFull>()
            .build()
            .expect("registry");

        let err = registry
            .to_request(&Orphan, None, 0, 3, Utc::now())
            .expect_err("unregistered");
        assert!(matches!(
            err,
            QueueError::Registry(RegistryError::UnregisteredType(_))
        ));

        let err = registry
            .to_request(&GetAnimeFull::new(1), None, 0, 3, Utc::now())
            .expect_err("precondition missing");
        assert!(matches!(
            err,
            QueueError::Registry(RegistryError::UnknownPrecondition { .. })
        ));
    }
}
