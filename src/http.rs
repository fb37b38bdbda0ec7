use std::{
    future::{ready, Ready},
    sync::Arc,
};

use actix_web::{
    dev::Payload,
    http::{
        header::{ContentDisposition, DispositionParam, DispositionType},
        StatusCode,
    },
    web, App, FromRequest, HttpRequest, HttpResponse, HttpServer, ResponseError,
};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    catalog::{CatalogError, CatalogStore},
    config::DEFAULT_IDENTITY_HEADER,
    engine::{
        delivery::{DeliveryError, DeliveryService},
        scheduler::RescanHandle,
    },
    models::{Identity, ROOT_FOLDER},
};

/// Shared by every worker.
#[derive(Clone)]
pub struct AppState {
    pub delivery: DeliveryService,
    pub store: Arc<dyn CatalogStore>,
    /// Nudged when a request finds the catalog ahead of the disk.
    pub rescan: Option<RescanHandle>,
    pub identity_header: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl ApiError {
    fn public_message(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "Unauthorized",
            ApiError::Delivery(DeliveryError::NotFound) => "File not found or access denied",
            ApiError::Delivery(DeliveryError::StaleCatalogEntry(_)) => "File not found on server",
            ApiError::Delivery(DeliveryError::InvalidPath(_)) => "Invalid file path",
            ApiError::Delivery(DeliveryError::StoreUnavailable(_)) | ApiError::Catalog(_) => "Catalog unavailable",
            ApiError::Delivery(DeliveryError::Io(_)) => "Internal server error",
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Delivery(DeliveryError::NotFound | DeliveryError::StaleCatalogEntry(_)) => StatusCode::NOT_FOUND,
            ApiError::Delivery(DeliveryError::InvalidPath(_)) => StatusCode::BAD_REQUEST,
            ApiError::Delivery(DeliveryError::StoreUnavailable(_)) | ApiError::Catalog(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Delivery(DeliveryError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "message": self.public_message() }))
    }
}

/// The auth layer in front of us puts the user id in a request header.
impl FromRequest for Identity {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let header = req
            .app_data::<web::Data<AppState>>()
            .map(|state| state.identity_header.as_str())
            .unwrap_or(DEFAULT_IDENTITY_HEADER);

        let id = req
            .headers()
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty());

        ready(id.map(Identity::new).ok_or(ApiError::Unauthorized))
    }
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/downloads", web::get().to(list_files))
        .route("/api/files", web::get().to(list_files))
        .route("/downloads/{path:.*}", web::get().to(download));
}

pub async fn serve(state: AppState, bind: &str) -> std::io::Result<()> {
    let data = web::Data::new(state);
    info!(bind, "http listening");
    HttpServer::new(move || App::new().app_data(data.clone()).configure(routes))
        .bind(bind)?
        .run()
        .await
}

async fn list_files(state: web::Data<AppState>, identity: Identity) -> Result<HttpResponse, ApiError> {
    let records = state.store.list_owned(&identity.id).await?;
    Ok(HttpResponse::Ok().json(records))
}

async fn download(
    state: web::Data<AppState>,
    identity: Identity,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let (folder, name) = split_request_path(&path);

    let delivery = match state.delivery.deliver(&identity, folder, name).await {
        Ok(delivery) => delivery,
        Err(err @ DeliveryError::StaleCatalogEntry(_)) => {
            warn!(error = %err, "catalog is behind the disk, requesting rescan");
            if let Some(rescan) = &state.rescan {
                rescan.request();
            }
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };

    let disposition = ContentDisposition {
        disposition: DispositionType::Attachment,
        parameters: vec![DispositionParam::Filename(delivery.filename.clone())],
    };

    Ok(HttpResponse::Ok()
        .content_type("application/octet-stream")
        .insert_header(disposition)
        .no_chunking(delivery.size)
        .streaming(delivery.into_stream()))
}

/// `a/b/c.txt` is folder `a/b`, name `c.txt`; a bare name is in the root folder.
fn split_request_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((folder, name)) => (folder, name),
        None => (ROOT_FOLDER, path),
    }
}
