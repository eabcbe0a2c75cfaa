//! Phone number to app routing.  One registry instance is built at startup and handed to the
//! handlers; it is changed only through its methods, and a reload swaps the whole table.

use crate::app::{AppDeps, AppInfo, VoiceApp};
use crate::conversation::{ConversationConfig, ConversationalApp};
use crate::error::AppError;
use crate::survey::{SurveyApp, SurveyConfig};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

/// One app as declared in the apps file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AppDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub numbers: Vec<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub fillers: Vec<String>,
    #[serde(default)]
    pub retries: Vec<String>,
    #[serde(flatten)]
    pub kind: AppKind,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppKind {
    Conversation(ConversationConfig),
    Survey(SurveyConfig),
}

impl AppDefinition {
    pub fn info(&self) -> AppInfo {
        AppInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            fillers: self.fillers.clone(),
            retries: self.retries.clone(),
            voice: self.voice.clone(),
        }
    }

    pub fn build(&self, deps: &AppDeps) -> Arc<dyn VoiceApp> {
        match &self.kind {
            AppKind::Conversation(config) => Arc::new(ConversationalApp::new(
                self.info(),
                config.clone(),
                deps.clone(),
            )),
            AppKind::Survey(config) => {
                Arc::new(SurveyApp::new(self.info(), config.clone(), deps.clone()))
            }
        }
    }
}

/// The app served when no definitions file is configured.
pub fn builtin_definitions() -> Vec<AppDefinition> {
    vec![AppDefinition {
        id: "assistant".to_string(),
        name: "Phone Assistant".to_string(),
        numbers: vec![],
        default: true,
        voice: None,
        fillers: vec![
            "One sec.".to_string(),
            "Let me think.".to_string(),
            "Hmm, good question.".to_string(),
        ],
        retries: vec![],
        kind: AppKind::Conversation(ConversationConfig {
            system_prompt: "You are a friendly assistant answering a phone call. Keep every answer \
                            to one to three short spoken sentences, with no lists or formatting."
                .to_string(),
            greetings: vec!["Hi there! What can I help you with?".to_string()],
            goodbyes: vec![],
            tools: vec!["current_time".to_string(), "caller_number".to_string()],
            max_tokens: Some(200),
        }),
    }]
}

pub async fn load_definitions(path: &Path) -> Result<Vec<AppDefinition>, AppError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    let defs: Vec<AppDefinition> = serde_json::from_str(&raw)?;
    Ok(defs)
}

#[derive(Default)]
struct Table {
    apps: HashMap<String, Arc<dyn VoiceApp>>,
    numbers: HashMap<String, String>,
    default_app: Option<String>,
}

impl Table {
    fn build(defs: &[AppDefinition], deps: &AppDeps) -> Result<Self, AppError> {
        let mut table = Table::default();
        for def in defs {
            if table.apps.contains_key(&def.id) {
                return Err(AppError::Config(format!("duplicate app id {}", def.id)));
            }
            table.apps.insert(def.id.clone(), def.build(deps));
            for number in &def.numbers {
                if let Some(previous) = table.numbers.insert(normalize(number), def.id.clone()) {
                    return Err(AppError::Config(format!(
                        "number {number} assigned to both {previous} and {}",
                        def.id
                    )));
                }
            }
            if def.default {
                if let Some(previous) = &table.default_app {
                    return Err(AppError::Config(format!(
                        "both {previous} and {} are marked default",
                        def.id
                    )));
                }
                table.default_app = Some(def.id.clone());
            }
        }
        if table.default_app.is_none() {
            if let Some(first) = defs.first() {
                warn!(app=%first.id, "no default app declared; using the first definition");
                table.default_app = Some(first.id.clone());
            }
        }
        Ok(table)
    }
}

fn normalize(number: &str) -> String {
    number
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect()
}

pub struct AppRegistry {
    table: RwLock<Table>,
}

impl Default for AppRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AppRegistry {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table::default()),
        }
    }

    pub fn load(defs: &[AppDefinition], deps: &AppDeps) -> Result<Self, AppError> {
        let table = Table::build(defs, deps)?;
        info!(apps = table.apps.len(), numbers = table.numbers.len(), "app registry loaded");
        Ok(Self {
            table: RwLock::new(table),
        })
    }

    /// Replace every app, number and the default in one step.  On error the current table is
    /// left untouched.
    pub fn reload(&self, defs: &[AppDefinition], deps: &AppDeps) -> Result<usize, AppError> {
        let table = Table::build(defs, deps)?;
        let count = table.apps.len();
        *self.write() = table;
        info!(apps = count, "app registry reloaded");
        Ok(count)
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, app: Arc<dyn VoiceApp>) -> Result<(), AppError> {
        let id = app.info().id.clone();
        let mut table = self.write();
        if table.apps.contains_key(&id) {
            return Err(AppError::Config(format!("app {id} is already registered")));
        }
        table.apps.insert(id, app);
        Ok(())
    }

    /// Swap the app registered under the same id.  Calls already in progress keep running
    /// against whatever instance they resolved.
    pub fn replace(&self, app: Arc<dyn VoiceApp>) -> Result<(), AppError> {
        let id = app.info().id.clone();
        let mut table = self.write();
        if !table.apps.contains_key(&id) {
            return Err(AppError::Config(format!("app {id} is not registered")));
        }
        table.apps.insert(id, app);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<dyn VoiceApp>> {
        let mut table = self.write();
        let removed = table.apps.remove(id)?;
        table.numbers.retain(|_, app_id| app_id.as_str() != id);
        if table.default_app.as_deref() == Some(id) {
            table.default_app = None;
        }
        Some(removed)
    }

    pub fn assign_number(&self, number: &str, id: &str) -> Result<(), AppError> {
        let mut table = self.write();
        if !table.apps.contains_key(id) {
            return Err(AppError::Config(format!("app {id} is not registered")));
        }
        table.numbers.insert(normalize(number), id.to_string());
        Ok(())
    }

    pub fn set_default(&self, id: &str) -> Result<(), AppError> {
        let mut table = self.write();
        if !table.apps.contains_key(id) {
            return Err(AppError::Config(format!("app {id} is not registered")));
        }
        table.default_app = Some(id.to_string());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn VoiceApp>> {
        self.read().apps.get(id).cloned()
    }

    /// App for a dialed number, falling back to the default app.
    pub fn resolve(&self, number: &str) -> Option<Arc<dyn VoiceApp>> {
        let table = self.read();
        table
            .numbers
            .get(&normalize(number))
            .or(table.default_app.as_ref())
            .and_then(|id| table.apps.get(id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.read().apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().apps.is_empty()
    }
}
