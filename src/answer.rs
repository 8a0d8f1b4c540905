//! Answer composition: prompt assembly, Gemini generation, citation
//! resolution, and the atomic history commit.
//!
//! The composer never leaks internal error text to the client. When
//! generation fails after retries the reply falls back to a fixed
//! Vietnamese message and only the user's question is recorded, so a
//! retried question starts from a clean exchange.

use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, warn};

use sqlx::SqlitePool;

use crate::config::GenerationConfig;
use crate::error::{PipelineError, Result};
use crate::models::{ChatMessage, LinkRef, MessageMetadata, Role, SearchHit, SourceRef};
use crate::session;

/// Reply shown when retrieval finds nothing above the score threshold.
fn no_context_reply(question: &str) -> String {
    format!(
        "Không tìm thấy thông tin phù hợp cho câu hỏi: '{}'\n\n\
         💡 **Gợi ý:** Hãy thử diễn đạt câu hỏi khác hoặc sử dụng từ khóa cụ thể hơn.",
        question
    )
}

/// Text generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(&self, prompt: &str) -> Result<String>;
}

// ============ Gemini ============

pub struct GeminiClient {
    base_url: String,
    model: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            PipelineError::ModelUnavailable(format!(
                "{} environment variable not set",
                config.api_key_env
            ))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::ModelUnavailable(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Generator for GeminiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self.client.post(&url).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| PipelineError::generation(e.to_string()))?;
                        return parse_gemini_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(if status.as_u16() == 429 {
                            PipelineError::rate_limited(format!(
                                "gemini rate limited: {}",
                                body_text
                            ))
                        } else {
                            PipelineError::generation(format!(
                                "gemini error {}: {}",
                                status, body_text
                            ))
                        });
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(PipelineError::generation(format!(
                        "gemini error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(PipelineError::generation(format!(
                        "gemini unreachable: {}",
                        e
                    )));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| PipelineError::generation("generation failed after retries")))
    }
}

fn parse_gemini_response(json: &serde_json::Value) -> Result<String> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| PipelineError::generation("gemini response has no candidates"))?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        return Err(PipelineError::generation("gemini returned empty text"));
    }
    Ok(text)
}

// ============ Prompt assembly ============

/// Build the Vietnamese RAG prompt from retrieved chunks and recent
/// history. Context entries are numbered so the model can cite them as
/// `[1]`, `[2]`, ...
pub fn build_prompt(question: &str, hits: &[SearchHit], history: &[ChatMessage]) -> String {
    let mut context = String::new();
    for (i, hit) in hits.iter().enumerate() {
        context.push_str(&format!(
            "[{}] **{}** (Độ liên quan: {:.3})\n{}\n\n",
            i + 1,
            hit.file_name,
            hit.score,
            hit.content
        ));
    }

    let mut history_block = String::new();
    for message in history {
        let speaker = match message.role {
            Role::User => "Người dùng",
            Role::Assistant => "Trợ lý",
            Role::System => continue,
        };
        history_block.push_str(&format!("{}: {}\n", speaker, message.content));
    }

    let mut prompt = String::from(
        "Bạn là một trợ lý AI chuyên về PokeMMO, một game Pokemon online. \
         Hãy trả lời câu hỏi của người dùng dựa trên thông tin được cung cấp.\n\n",
    );
    if !history_block.is_empty() {
        prompt.push_str("**Lịch sử hội thoại gần đây:**\n");
        prompt.push_str(&history_block);
        prompt.push('\n');
    }
    prompt.push_str(&format!("**Câu hỏi của người dùng:** {}\n\n", question));
    prompt.push_str("**Thông tin tham khảo:**\n");
    prompt.push_str(&context);
    prompt.push_str(
        "**Hướng dẫn trả lời:**\n\
         1. Trả lời chính xác dựa trên thông tin được cung cấp\n\
         2. Trích dẫn nguồn bằng số trong ngoặc vuông, ví dụ [1]\n\
         3. Trả lời bằng tiếng Việt, thân thiện và dễ hiểu\n\
         4. Nếu cần thêm thông tin, hãy đề xuất người dùng tìm hiểu thêm\n\
         5. Nếu có link hoặc hình ảnh liên quan, hãy đề cập đến\n\n\
         **Trả lời:**\n",
    );
    prompt
}

// ============ Citation resolution ============

fn citation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+)\]").unwrap())
}

/// Map `[n]` markers in the generated answer back to the prompt's numbered
/// chunks. Out-of-range markers are dropped, duplicates collapse to one
/// entry, and an answer without markers credits every prompt chunk in
/// score order.
pub fn resolve_citations(answer: &str, hits: &[SearchHit]) -> Vec<SourceRef> {
    let mut seen = vec![false; hits.len()];
    let mut sources = Vec::new();

    for cap in citation_regex().captures_iter(answer) {
        let n: usize = match cap[1].parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        if n == 0 || n > hits.len() || seen[n - 1] {
            continue;
        }
        seen[n - 1] = true;
        sources.push(SourceRef {
            source_id: n,
            file_name: hits[n - 1].file_name.clone(),
            score: hits[n - 1].score,
        });
    }

    if sources.is_empty() && !hits.is_empty() {
        for (i, hit) in hits.iter().enumerate() {
            sources.push(SourceRef {
                source_id: i + 1,
                file_name: hit.file_name.clone(),
                score: hit.score,
            });
        }
    }
    sources
}

/// Collect image names and links from the cited chunks, deduplicated in
/// first-seen order.
fn collect_media(hits: &[SearchHit], sources: &[SourceRef]) -> (Vec<String>, Vec<LinkRef>) {
    let mut images = Vec::new();
    let mut links: Vec<LinkRef> = Vec::new();
    for source in sources {
        let hit = &hits[source.source_id - 1];
        for image in &hit.metadata.images {
            if !images.contains(image) {
                images.push(image.clone());
            }
        }
        for link in &hit.metadata.links {
            if !links.iter().any(|l| l.url == link.url) {
                links.push(link.clone());
            }
        }
    }
    (images, links)
}

// ============ Composer ============

/// The composed reply for one chat turn.
#[derive(Debug)]
pub struct ChatReply {
    pub response: String,
    pub sources: Vec<SourceRef>,
    pub images: Vec<String>,
    pub links: Vec<LinkRef>,
}

/// Run one full chat turn: prompt assembly, generation, citation
/// resolution, and the history commit. Retrieval has already happened;
/// `hits` may be empty.
pub async fn compose(
    pool: &SqlitePool,
    generator: &dyn Generator,
    config: &GenerationConfig,
    session_id: &str,
    question: &str,
    hits: &[SearchHit],
) -> Result<ChatReply> {
    if question.trim().is_empty() {
        return Err(PipelineError::InvalidInput(
            "message must not be empty".to_string(),
        ));
    }

    if hits.is_empty() {
        let response = no_context_reply(question);
        session::append_exchange(
            pool,
            session_id,
            question,
            &response,
            &MessageMetadata::default(),
        )
        .await?;
        return Ok(ChatReply {
            response,
            sources: Vec::new(),
            images: Vec::new(),
            links: Vec::new(),
        });
    }

    let history = session::get_history(pool, session_id, config.history_limit * 2).await?;
    let prompt = build_prompt(question, hits, &history);

    match generator.generate(&prompt).await {
        Ok(answer) => {
            let sources = resolve_citations(&answer, hits);
            let (images, links) = collect_media(hits, &sources);
            let metadata = MessageMetadata {
                sources: sources.clone(),
                images: images.clone(),
                links: links.clone(),
            };
            session::append_exchange(pool, session_id, question, &answer, &metadata).await?;
            Ok(ChatReply {
                response: answer,
                sources,
                images,
                links,
            })
        }
        Err(e) => {
            if matches!(
                &e,
                PipelineError::GenerationFailure { rate_limited, .. } if *rate_limited
            ) {
                warn!(session_id, "generation rate limited, returning fallback");
            } else {
                error!(session_id, error = %e, "generation failed, returning fallback");
            }
            // Only the question is recorded; the fallback text is not part
            // of the conversation the model will see next turn.
            session::append(
                pool,
                session_id,
                Role::User,
                question,
                &MessageMetadata::default(),
            )
            .await?;
            Ok(ChatReply {
                response: config.fallback_message.clone(),
                sources: Vec::new(),
                images: Vec::new(),
                links: Vec::new(),
            })
        }
    }
}
