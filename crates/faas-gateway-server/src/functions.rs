use async_trait::async_trait;
use chrono::Utc;
use faas_common::{FaasError, Function, Language, Result, Virtualization, DEFAULT_TIMEOUT_MS};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

/// Body of `POST /functions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFunction {
    pub name: String,
    pub language: Language,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtualization: Option<Virtualization>,
}

/// Body of `PUT /functions/{id}`. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtualization: Option<Virtualization>,
}

/// Where function definitions live. The executor only ever reads from it.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Function>>;

    async fn get(&self, id: &str) -> Result<Option<Function>>;

    async fn create(&self, new: NewFunction) -> Result<Function>;

    /// Fails with [`FaasError::NotFound`] for an unknown id.
    async fn update(&self, id: &str, update: FunctionUpdate) -> Result<Function>;

    /// Returns whether a definition was removed.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Definitions kept in insertion order for the lifetime of the process.
#[derive(Default)]
pub struct InMemoryFunctionStore {
    functions: RwLock<Vec<Function>>,
}

impl InMemoryFunctionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ensure_unique_name(functions: &[Function], name: &str, except: Option<&str>) -> Result<()> {
    let taken = functions
        .iter()
        .any(|f| f.name == name && Some(f.id.as_str()) != except);
    if taken {
        return Err(FaasError::DefinitionInvalid(format!(
            "a function named '{name}' already exists"
        )));
    }
    Ok(())
}

#[async_trait]
impl FunctionStore for InMemoryFunctionStore {
    async fn list(&self) -> Result<Vec<Function>> {
        Ok(self.functions.read().await.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Function>> {
        Ok(self
            .functions
            .read()
            .await
            .iter()
            .find(|f| f.id == id)
            .cloned())
    }

    async fn create(&self, new: NewFunction) -> Result<Function> {
        let function = Function::new(
            new.name.trim(),
            new.language,
            new.code,
            new.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            new.virtualization.unwrap_or_default(),
        );
        function.validate()?;

        let mut functions = self.functions.write().await;
        ensure_unique_name(&functions, &function.name, None)?;
        functions.push(function.clone());
        info!(function_id = %function.id, name = %function.name, "Function created");
        Ok(function)
    }

    async fn update(&self, id: &str, update: FunctionUpdate) -> Result<Function> {
        let mut functions = self.functions.write().await;
        let index = functions
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| FaasError::NotFound(format!("function {id}")))?;

        let mut updated = functions[index].clone();
        if let Some(name) = update.name {
            updated.name = name.trim().to_string();
        }
        if let Some(language) = update.language {
            updated.language = language;
        }
        if let Some(code) = update.code {
            updated.code = code;
        }
        if let Some(timeout) = update.timeout {
            updated.timeout = timeout;
        }
        if let Some(virtualization) = update.virtualization {
            updated.virtualization = virtualization;
        }
        updated.validate()?;
        ensure_unique_name(&functions, &updated.name, Some(id))?;
        updated.updated_at = Utc::now();

        functions[index] = updated.clone();
        info!(function_id = %id, "Function updated");
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut functions = self.functions.write().await;
        let before = functions.len();
        functions.retain(|f| f.id != id);
        let removed = functions.len() != before;
        if removed {
            info!(function_id = %id, "Function deleted");
        }
        Ok(removed)
    }
}
