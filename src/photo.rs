use base64::Engine;
use serde_json::Value;
use thiserror::Error;

use crate::gemini::{GeminiClient, GeminiReply, InlineImage};

#[derive(Debug, Error)]
pub enum PhotoError {
    #[error("{0}")]
    InvalidImage(String),
    #[error("model reply is not valid JSON")]
    Unparseable { raw_text: String },
    #[error("model call failed: {0}")]
    Provider(#[from] anyhow::Error),
}

const EXTRACTION_PROMPT: &str = r#"你是一個專業的醫療資訊數位化助手。請辨識附圖（可能包含多張藥袋或看診單），並將內容整合為單一的 JSON 格式輸出。
請嚴格遵守以下規則：
1. 輸出格式必須是標準的 JSON，不要有任何 Markdown code block 或多餘說明。
2. 若圖片中沒有該項資訊，請在 JSON 值中填入 null。
3. 日期格式統一轉換為 YYYY-MM-DD，若只有民國年請自動換算為西元年。
4. 藥物請分析藥名與用法，在 usage_type 欄位標示 "regular"（固定服用）或 "prn"（需要時服用）。
5. 若有多張圖片，請整併資訊並去除重複內容。
請依照此 JSON 結構輸出：
{
  "hospital_info": { "name": "醫院或診所名稱", "address": "地址", "department": "科別", "doctor_name": "醫生姓名" },
  "patient_info": { "visit_date": "YYYY-MM-DD", "follow_up_date": "YYYY-MM-DD", "follow_up_time": "HH:MM", "days_supply": "給藥天數(整數)" },
  "medications": [ { "name": "藥品名稱", "indication": "推測用途", "dosage": "用法用量", "usage_type": "regular 或 prn" } ],
  "notes": { "side_effects": "醫囑或副作用", "warnings": "其他標語" }
}"#;

/// Medicine bags and visit slips to structured JSON.
#[derive(Clone)]
pub struct PhotoExtractor {
    gemini: GeminiClient,
}

impl PhotoExtractor {
    pub fn new(gemini: GeminiClient) -> Self {
        Self { gemini }
    }

    pub async fn extract(&self, image: &InlineImage) -> Result<Value, PhotoError> {
        let first = self.gemini.generate_json(EXTRACTION_PROMPT, Some(image)).await?;
        let raw_text = match first {
            GeminiReply::Json(value) => return Ok(value),
            GeminiReply::Text(text) => text,
        };

        tracing::warn!("photo extraction reply was not JSON; asking the model to repair it");
        match self.gemini.generate_json(&repair_prompt(&raw_text), None).await? {
            GeminiReply::Json(value) => Ok(value),
            GeminiReply::Text(_) => {
                tracing::error!("photo extraction reply still unparseable after repair");
                Err(PhotoError::Unparseable { raw_text })
            }
        }
    }
}

fn repair_prompt(raw: &str) -> String {
    format!(
        "以下內容不是合法 JSON，請你「只修正格式」，不要新增或刪除任何資料。\n\
         請只輸出「純 JSON 字串」，不要任何說明或標記。\n\
         錯誤內容如下：\n{raw}"
    )
}

/// Normalizes a client-supplied image: strips a `data:` URL prefix, checks the
/// payload decodes, and sniffs the mime type when none was given.
pub fn prepare_image(base64_payload: &str, mime_type: Option<&str>) -> Result<InlineImage, PhotoError> {
    let trimmed = base64_payload.trim();
    let (declared, data) = match trimmed.strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest
                .split_once(',')
                .ok_or_else(|| PhotoError::InvalidImage("malformed data URL".into()))?;
            let mime = header.split(';').next().filter(|m| !m.is_empty());
            (mime.map(str::to_string), data.trim())
        }
        None => (None, trimmed),
    };

    if data.is_empty() {
        return Err(PhotoError::InvalidImage("image payload is empty".into()));
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|err| PhotoError::InvalidImage(format!("image is not valid base64: {err}")))?;

    let mime_type = mime_type
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .or(declared)
        .unwrap_or_else(|| sniff_mime(&bytes).to_string());

    Ok(InlineImage {
        mime_type,
        data: data.to_string(),
    })
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        [_, _, _, _, b'f', b't', b'y', b'p', b'h', b'e', b'i', b'c', ..] => "image/heic",
        _ => "image/jpeg",
    }
}
