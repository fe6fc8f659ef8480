use crate::auth::{Credentials, Identity};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::models::file::Upload;
use crate::models::{Fields, Kind};
use crate::process::{CollectionProcessor, Created, ObjectProcessor, Payload, RelationshipReconciler};
use crate::registry::Failure;
use actix_multipart::Multipart;
use actix_web::http::header;
use actix_web::web::{self, Bytes, Data};
use actix_web::{HttpRequest, HttpResponse};
use futures::TryStreamExt;
use log::debug;
use serde_json::{json, Map, Value};
use std::io;
use uuid::Uuid;

const FAILURES_KEY: &str = "failures";

pub const DEFAULT_UPLOAD_LIMIT: usize = 64 * 1024 * 1024;

/// Most bytes a single upload request may carry, summed over all its parts.
/// Read from app data, [`DEFAULT_UPLOAD_LIMIT`] when not registered.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UploadLimit(pub usize);

impl Default for UploadLimit {
    fn default() -> Self {
        UploadLimit(DEFAULT_UPLOAD_LIMIT)
    }
}

pub fn register_routes(config: &mut web::ServiceConfig) {
    config
        .route("/", web::get().to(root))
        .service(
            web::resource("/tokens/")
                .route(web::get().to(get_token))
                .route(web::post().to(regenerate_token))
                .default_service(web::to(bad_method)),
        )
        .service(
            web::resource("/files/")
                .route(web::get().to(list_files))
                .route(web::post().to(upload_files))
                .default_service(web::to(bad_method)),
        )
        .service(
            web::resource("/{collection}/")
                .route(web::get().to(list_collection))
                .route(web::post().to(create_in_collection))
                .default_service(web::to(bad_method)),
        )
        .service(
            web::resource("/{collection}/{id}/")
                .route(web::get().to(get_object))
                .route(web::put().to(update_object))
                .route(web::delete().to(delete_object))
                .default_service(web::to(bad_method)),
        )
        .service(
            web::resource("/{collection}/{id}/{member}/")
                .route(web::get().to(list_member))
                .route(web::post().to(create_member))
                .route(web::put().to(add_members))
                .route(web::delete().to(remove_members))
                .default_service(web::to(bad_method)),
        );
}

async fn root() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": "Welcome to the COGS grading API",
    }))
}

async fn bad_method(req: HttpRequest) -> Result<HttpResponse> {
    Err(Error::UnsupportedOperation(format!(
        "{} {}",
        req.method(),
        req.path()
    )))
}

async fn authenticate(ctx: &Data<Context>, req: &HttpRequest) -> Result<Identity> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or(Error::AuthenticationRejected)?;
    let header = header
        .to_str()
        .map_err(|_| Error::malformed("authorization header is not text"))?;
    let credentials = Credentials::from_authorization(header)?;

    // Password hashing is slow enough to keep off the request threads.
    let ctx = ctx.clone();
    web::block(move || ctx.auth.verify(&credentials))
        .await
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?
}

fn parse_kind(collection: &str) -> Result<Kind> {
    Kind::from_collection(collection)
        .ok_or_else(|| Error::NotFound(format!("collection '{}'", collection)))
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).map_err(|_| Error::malformed(format!("'{}' is not a valid identifier", id)))
}

fn parse_fields(body: &[u8]) -> Result<Fields> {
    match Payload::from_json(body)? {
        Payload::Object(fields) => Ok(fields),
        Payload::Uploads(_) => Err(Error::malformed("expected a JSON object")),
    }
}

fn id_list<I: IntoIterator<Item = Uuid>>(ids: I) -> Value {
    Value::Array(ids.into_iter().map(|id| Value::from(id.to_string())).collect())
}

fn list_response<I: IntoIterator<Item = Uuid>>(key: &str, ids: I) -> HttpResponse {
    let mut body = Map::new();
    body.insert(key.to_string(), id_list(ids));
    HttpResponse::Ok().json(Value::Object(body))
}

fn failures_value(failures: &[Failure]) -> Value {
    serde_json::to_value(failures).unwrap_or(Value::Null)
}

fn created_response(key: &str, created: Created) -> HttpResponse {
    let mut body = Map::new();
    body.insert(key.to_string(), id_list(created.ids));
    if !created.failures.is_empty() {
        body.insert(FAILURES_KEY.to_string(), failures_value(&created.failures));
    }
    HttpResponse::Ok().json(Value::Object(body))
}

fn object_response(id: Uuid, dict: Value) -> HttpResponse {
    let mut body = Map::new();
    body.insert(id.to_string(), dict);
    HttpResponse::Ok().json(Value::Object(body))
}

async fn get_token(ctx: Data<Context>, req: HttpRequest) -> Result<HttpResponse> {
    let identity = authenticate(&ctx, &req).await?;
    let token = ctx.auth.token(&identity)?;
    Ok(HttpResponse::Ok().json(json!({ "token": token })))
}

async fn regenerate_token(ctx: Data<Context>, req: HttpRequest) -> Result<HttpResponse> {
    let identity = authenticate(&ctx, &req).await?;
    let token = ctx.auth.regenerate_token(&identity)?;
    Ok(HttpResponse::Ok().json(json!({ "token": token })))
}

async fn list_in(ctx: &Data<Context>, req: &HttpRequest, kind: Kind) -> Result<HttpResponse> {
    let identity = authenticate(ctx, req).await?;
    let ids = CollectionProcessor::new(ctx, kind).list(&identity)?;
    Ok(list_response(kind.namespace(), ids))
}

async fn list_files(ctx: Data<Context>, req: HttpRequest) -> Result<HttpResponse> {
    list_in(&ctx, &req, Kind::File).await
}

async fn read_uploads(mut payload: Multipart, limit: UploadLimit) -> Result<Vec<Upload>> {
    let multipart_error = |e: actix_multipart::MultipartError| Error::malformed(e.to_string());
    let mut uploads = Vec::new();
    let mut total = 0;
    while let Some(mut field) = payload.try_next().await.map_err(multipart_error)? {
        let disposition = field.content_disposition();
        let key = disposition.get_name().unwrap_or_default().to_string();
        let filename = disposition.get_filename().map(str::to_string);
        let content_type = field
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let mut content = Vec::new();
        while let Some(chunk) = field.try_next().await.map_err(multipart_error)? {
            total += chunk.len();
            if total > limit.0 {
                return Err(Error::TooLarge(format!("uploads exceed {} bytes", limit.0)));
            }
            content.extend_from_slice(&chunk);
        }
        match filename {
            Some(filename) => uploads.push(Upload {
                key,
                filename,
                content_type,
                content,
            }),
            None => debug!("Ignoring non-file form field '{}'", key),
        }
    }
    Ok(uploads)
}

async fn upload_files(ctx: Data<Context>, req: HttpRequest, payload: Multipart) -> Result<HttpResponse> {
    let identity = authenticate(&ctx, &req).await?;
    let limit = req.app_data::<UploadLimit>().copied().unwrap_or_default();
    let uploads = read_uploads(payload, limit).await?;
    let created = CollectionProcessor::new(&ctx, Kind::File).create(&identity, Payload::Uploads(uploads))?;
    Ok(created_response(Kind::File.namespace(), created))
}

async fn list_collection(
    ctx: Data<Context>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let kind = parse_kind(&path)?;
    list_in(&ctx, &req, kind).await
}

async fn create_in_collection(
    ctx: Data<Context>,
    req: HttpRequest,
    path: web::Path<String>,
    body: Bytes,
) -> Result<HttpResponse> {
    let identity = authenticate(&ctx, &req).await?;
    let kind = parse_kind(&path)?;
    let created = CollectionProcessor::new(&ctx, kind).create(&identity, Payload::from_json(&body)?)?;
    Ok(created_response(kind.namespace(), created))
}

async fn get_object(
    ctx: Data<Context>,
    req: HttpRequest,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse> {
    let identity = authenticate(&ctx, &req).await?;
    let (kind, id) = (parse_kind(&path.0)?, parse_id(&path.1)?);
    let record = ObjectProcessor::new(&ctx, kind).get(&identity, id)?;
    Ok(object_response(id, record.to_dict()))
}

async fn update_object(
    ctx: Data<Context>,
    req: HttpRequest,
    path: web::Path<(String, String)>,
    body: Bytes,
) -> Result<HttpResponse> {
    let identity = authenticate(&ctx, &req).await?;
    let (kind, id) = (parse_kind(&path.0)?, parse_id(&path.1)?);
    let record = ObjectProcessor::new(&ctx, kind).update(&identity, id, parse_fields(&body)?)?;
    Ok(object_response(id, record.to_dict()))
}

async fn delete_object(
    ctx: Data<Context>,
    req: HttpRequest,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse> {
    let identity = authenticate(&ctx, &req).await?;
    let (kind, id) = (parse_kind(&path.0)?, parse_id(&path.1)?);
    let deleted = ObjectProcessor::new(&ctx, kind).delete(&identity, id)?;

    let mut body = Map::new();
    body.insert(id.to_string(), deleted.record.to_dict());
    if !deleted.cascaded.is_empty() {
        body.insert("cascaded".to_string(), id_list(deleted.cascaded));
    }
    if !deleted.failures.is_empty() {
        body.insert(FAILURES_KEY.to_string(), failures_value(&deleted.failures));
    }
    Ok(HttpResponse::Ok().json(Value::Object(body)))
}

fn parse_member(path: &(String, String, String)) -> Result<(Kind, Uuid, &str)> {
    Ok((parse_kind(&path.0)?, parse_id(&path.1)?, path.2.as_str()))
}

async fn list_member(
    ctx: Data<Context>,
    req: HttpRequest,
    path: web::Path<(String, String, String)>,
) -> Result<HttpResponse> {
    let identity = authenticate(&ctx, &req).await?;
    let (kind, id, member) = parse_member(&path)?;
    if kind.children(member).is_some() {
        let ids = CollectionProcessor::nested(&ctx, kind, id, member)?.list(&identity)?;
        return Ok(list_response(member, ids));
    }
    let reconciler = RelationshipReconciler::new(&ctx, kind, member)?;
    Ok(list_response(member, reconciler.list(&identity, id)?))
}

async fn create_member(
    ctx: Data<Context>,
    req: HttpRequest,
    path: web::Path<(String, String, String)>,
    body: Bytes,
) -> Result<HttpResponse> {
    let identity = authenticate(&ctx, &req).await?;
    let (kind, id, member) = parse_member(&path)?;
    if kind.relation(member).is_some() {
        return Err(Error::UnsupportedOperation(format!(
            "POST to relation '{}', use PUT or DELETE",
            member
        )));
    }
    let processor = CollectionProcessor::nested(&ctx, kind, id, member)?;
    let created = processor.create(&identity, Payload::from_json(&body)?)?;
    Ok(created_response(member, created))
}

async fn relate(
    ctx: Data<Context>,
    req: HttpRequest,
    path: web::Path<(String, String, String)>,
    body: Bytes,
    adding: bool,
) -> Result<HttpResponse> {
    let identity = authenticate(&ctx, &req).await?;
    let (kind, id, member) = parse_member(&path)?;
    if kind.children(member).is_some() {
        return Err(Error::UnsupportedOperation(format!(
            "{} {} is not a relation",
            req.method(),
            member
        )));
    }
    let reconciler = RelationshipReconciler::new(&ctx, kind, member)?;
    let peers = reconciler.parse_ids(&body)?;
    let members = if adding {
        reconciler.add(&identity, id, &peers)?
    } else {
        reconciler.remove(&identity, id, &peers)?
    };
    Ok(list_response(reconciler.name(), members))
}

async fn add_members(
    ctx: Data<Context>,
    req: HttpRequest,
    path: web::Path<(String, String, String)>,
    body: Bytes,
) -> Result<HttpResponse> {
    relate(ctx, req, path, body, true).await
}

async fn remove_members(
    ctx: Data<Context>,
    req: HttpRequest,
    path: web::Path<(String, String, String)>,
    body: Bytes,
) -> Result<HttpResponse> {
    relate(ctx, req, path, body, false).await
}
