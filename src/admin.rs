use axum::{
    extract::{Extension, Path},
    Json,
};
use serde_json::{json, Map, Value};

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::registry::PluginDescriptor;
use crate::routes::AppState;

fn require_admin(user: &AuthUser) -> AppResult<()> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

/// key: admin -> plugin lifecycle management
pub async fn list_plugins(
    Extension(state): Extension<AppState>,
    user: AuthUser,
) -> AppResult<Json<Vec<PluginDescriptor>>> {
    require_admin(&user)?;
    Ok(Json(state.registry.list()))
}

pub async fn enable_plugin(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    require_admin(&user)?;
    state.registry.enable(&name)?;
    Ok(Json(json!({ "plugin": name, "status": "enabled" })))
}

pub async fn disable_plugin(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    require_admin(&user)?;
    state.registry.disable(&name)?;
    Ok(Json(json!({ "plugin": name, "status": "disabled" })))
}

pub async fn get_plugin_config(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
) -> AppResult<Json<Map<String, Value>>> {
    require_admin(&user)?;
    if state.registry.descriptor(&name).is_none() {
        return Err(AppError::NotFound);
    }
    Ok(Json(state.store.get_config(&name)?))
}

/// Persists to the ConfigStore only. Adapters resolve credentials fresh from
/// the store on every call, so an update takes effect without a restart.
pub async fn put_plugin_config(
    Extension(state): Extension<AppState>,
    user: AuthUser,
    Path(name): Path<String>,
    Json(config): Json<Map<String, Value>>,
) -> AppResult<Json<Value>> {
    require_admin(&user)?;
    if state.registry.descriptor(&name).is_none() {
        return Err(AppError::NotFound);
    }
    state.store.save_config(&name, config)?;
    Ok(Json(json!({ "plugin": name, "saved": true })))
}
