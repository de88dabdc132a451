use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::response::{Html, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use pdf_rag_core::{KnowledgeBase, KnowledgeBaseStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const MAX_HISTORY_TURNS: usize = 10;
const MAX_FILE_BYTES: usize = 64 * 1024 * 1024;
const MAX_REQUEST_BYTES: usize = 512 * 1024 * 1024;
const SYSTEM_PROMPT: &str = "You are a professional knowledge question answering assistant.";

const INDEX_HTML: &str = include_str!("../templates/index.html");
const RAG_HTML: &str = include_str!("../templates/rag.html");

#[derive(Clone)]
pub struct AppState {
    knowledge_base: Arc<RwLock<KnowledgeBase>>,
    upload_dir: Arc<PathBuf>,
    max_file_bytes: usize,
}

impl AppState {
    pub fn new(knowledge_base: Arc<RwLock<KnowledgeBase>>, upload_dir: PathBuf) -> Self {
        Self {
            knowledge_base,
            upload_dir: Arc::new(upload_dir),
            max_file_bytes: MAX_FILE_BYTES,
        }
    }

    /// Caps the size of each uploaded file; the request as a whole may carry several.
    pub fn with_max_file_bytes(mut self, max_file_bytes: usize) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(chat_page).post(chat))
        .route("/RAG", get(rag_page).post(upload))
        .route("/clear", post(clear))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .with_state(state)
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct RagParams {
    notice: Option<String>,
}

async fn chat_page() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Json<ChatResponse> {
    let prompt = build_prompt(&request.history, &request.message);

    let knowledge_base = state.knowledge_base.read().await;
    let outcome = knowledge_base.query(&prompt).await;
    drop(knowledge_base);

    let response = match outcome {
        Ok(result) => result.response,
        Err(error) => {
            warn!(%error, "chat query failed");
            format!("Error calling the language model: {error}")
        }
    };
    Json(ChatResponse { response })
}

/// Flattens the chat into one prompt, keeping only the most recent turns.
pub fn build_prompt(history: &[ChatTurn], message: &str) -> String {
    let recent = &history[history.len().saturating_sub(MAX_HISTORY_TURNS)..];

    let mut prompt = format!("System: {SYSTEM_PROMPT}\n");
    for turn in recent {
        let label = match turn.role.as_str() {
            "system" => "System",
            "user" => "User",
            "assistant" => "Assistant",
            _ => continue,
        };
        prompt.push_str(&format!("{label}: {}\n", turn.content));
    }
    prompt.push_str(&format!("User: {message}\n"));
    prompt
}

async fn rag_page(State(state): State<AppState>, Query(params): Query<RagParams>) -> Html<String> {
    let notices = params
        .notice
        .as_deref()
        .and_then(notice_message)
        .map(|message| vec![message.to_string()])
        .unwrap_or_default();
    let status = state.knowledge_base.read().await.status().await;
    Html(render_rag_page(&status, &notices))
}

async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Html<String> {
    let mut notices = Vec::new();
    let mut added = 0usize;

    loop {
        let mut field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "upload stream ended early");
                notices.push(format!("Upload interrupted: {error}"));
                break;
            }
        };
        if field.name() != Some("pdf") {
            continue;
        }
        let Some(original) = field.file_name().map(str::to_string) else {
            continue;
        };
        if original.is_empty() {
            continue;
        }

        let data = match read_limited(&mut field, state.max_file_bytes).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                warn!(file = %original, limit = state.max_file_bytes, "upload too large");
                notices.push(format!(
                    "File {original} exceeds the upload limit of {} bytes and was skipped.",
                    state.max_file_bytes
                ));
                continue;
            }
            Err(error) => {
                warn!(file = %original, %error, "upload stream ended early");
                notices.push(format!("Upload interrupted: {error}"));
                break;
            }
        };

        let Some(file_name) = sanitize_filename(&original) else {
            warn!(file = %original, "rejected upload with unusable file name");
            notices.push(format!("File {original} has an invalid name and was skipped."));
            continue;
        };

        let path = state.upload_dir.join(&file_name);
        if let Err(error) = tokio::fs::write(&path, &data).await {
            error!(path = %path.display(), %error, "failed to save upload");
            notices.push(format!("File {file_name} could not be saved or added: {error}"));
            continue;
        }

        let outcome = state
            .knowledge_base
            .write()
            .await
            .add_pdf_document(&path)
            .await;
        match outcome {
            Ok(report) => {
                info!(file = %file_name, chunks = report.chunks, "upload indexed");
                added += 1;
            }
            Err(error) => {
                notices.push(format!("File {file_name} could not be saved or added: {error}"));
            }
        }
    }

    if added > 0 {
        notices.push(format!("Uploaded {added} file(s) successfully."));
    } else if notices.is_empty() {
        notices.push("No PDF files were selected.".to_string());
    }

    let status = state.knowledge_base.read().await.status().await;
    Html(render_rag_page(&status, &notices))
}

/// Reads one multipart field; `None` when it grows past `limit`, in which case
/// the rest of the field is drained so the next one can be read.
async fn read_limited(
    field: &mut Field<'_>,
    limit: usize,
) -> Result<Option<Vec<u8>>, MultipartError> {
    let mut data = Vec::new();
    let mut oversized = false;
    while let Some(chunk) = field.chunk().await? {
        if oversized {
            continue;
        }
        if data.len() + chunk.len() > limit {
            oversized = true;
            data = Vec::new();
            continue;
        }
        data.extend_from_slice(&chunk);
    }
    Ok((!oversized).then_some(data))
}

async fn clear(State(state): State<AppState>) -> Redirect {
    let outcome = state.knowledge_base.write().await.clear().await;
    let notice = match outcome {
        Ok(()) => "cleared",
        Err(error) => {
            error!(%error, "failed to clear knowledge base");
            "clear_failed"
        }
    };

    remove_uploaded_files(&state.upload_dir).await;
    Redirect::to(&format!("/RAG?notice={notice}"))
}

async fn status(State(state): State<AppState>) -> Json<KnowledgeBaseStatus> {
    Json(state.knowledge_base.read().await.status().await)
}

async fn remove_uploaded_files(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            warn!(dir = %dir.display(), %error, "cannot read upload dir");
            return;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!(dir = %dir.display(), %error, "cannot list upload dir");
                break;
            }
        };
        let path = entry.path();
        let is_file = entry
            .file_type()
            .await
            .map(|kind| kind.is_file())
            .unwrap_or(false);
        if !is_file {
            continue;
        }
        if let Err(error) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), %error, "failed to delete uploaded file");
        }
    }
}

fn notice_message(code: &str) -> Option<&'static str> {
    match code {
        "cleared" => Some("Knowledge base cleared."),
        "clear_failed" => Some("Clearing the knowledge base failed, see the server log."),
        _ => None,
    }
}

/// Reduces an uploaded file name to a safe ASCII name; `None` when nothing usable remains.
/// A name whose stem has no ASCII left keeps its extension under a generated stem.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let normalized = raw.trim().replace('\\', "/");
    let extension = Path::new(&normalized)
        .extension()
        .and_then(|extension| extension.to_str())
        .map(clean_name_part)
        .filter(|extension| !extension.is_empty());

    let Some(extension) = extension else {
        let cleaned = clean_name_part(&normalized);
        return (!cleaned.is_empty()).then_some(cleaned);
    };

    let stem_end = normalized.rfind('.').unwrap_or(normalized.len());
    let stem = clean_name_part(&normalized[..stem_end]);
    if stem.is_empty() {
        let generated = Utc::now().format("upload_%Y%m%d%H%M%S%f");
        return Some(format!("{generated}.{extension}"));
    }
    Some(format!("{stem}.{extension}"))
}

fn clean_name_part(raw: &str) -> String {
    let spaced = raw
        .chars()
        .map(|ch| if ch == '/' || ch == '\\' { ' ' } else { ch })
        .collect::<String>();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept = joined
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-'))
        .collect::<String>();
    kept.trim_matches(|ch| ch == '.' || ch == '_').to_string()
}

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn render_rag_page(status: &KnowledgeBaseStatus, notices: &[String]) -> String {
    let rows = [
        ("Initialized", (if status.initialized { "yes" } else { "no" }).to_string()),
        ("Chunks", status.document_count.to_string()),
        ("Table", status.table_name.clone()),
        ("Embedding model", status.embedding_model.clone()),
        ("Embedding dimension", status.embedding_dim.clone()),
        ("LLM", status.llm_model.clone()),
    ]
    .iter()
    .map(|(label, value)| format!("<tr><th>{label}</th><td>{}</td></tr>", escape_html(value)))
    .collect::<Vec<_>>()
    .join("\n");

    let notices = notices
        .iter()
        .map(|notice| format!("<li>{}</li>", escape_html(notice)))
        .collect::<Vec<_>>()
        .join("\n");

    RAG_HTML
        .replace("{{status_rows}}", &rows)
        .replace("{{notices}}", &notices)
}
