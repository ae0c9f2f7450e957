//! C11: inlines user-supplied image/file references into the upstream's
//! attachment shape, and applies the one hardcoded system-message rewrite
//! rule the upstream needs for a specific logical model.

use base64::Engine;
use chatrelay_protocol::openai::chat::{
    ChatCompletionRequestMessage, ChatCompletionUserContent, ChatCompletionUserContentPart,
};
use chatrelay_upstream::UpstreamHttpClient;
use serde_json::{json, Value};
use wreq::Method;

use crate::error::CoreError;

const UPLOAD_HANDSHAKE_PATH: &str = "/api/get_upload_personal_image_url";

/// The one logical model the upstream requires system→user role rewriting
/// for, stamping assistant turns with a `session_state.models` hint.
pub const SYSTEM_REWRITE_MODEL: &str = "deepseek-r1";

pub async fn preprocess_messages(
    http: &UpstreamHttpClient,
    cookie: &str,
    model: &str,
    messages: Vec<ChatCompletionRequestMessage>,
) -> Result<Vec<Value>, CoreError> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let rewritten = inline_attachments(http, cookie, message).await?;
        out.push(rewritten);
    }
    if model == SYSTEM_REWRITE_MODEL {
        apply_system_rewrite(&mut out, model);
    }
    Ok(out)
}

async fn inline_attachments(
    http: &UpstreamHttpClient,
    cookie: &str,
    message: ChatCompletionRequestMessage,
) -> Result<Value, CoreError> {
    let user = match message {
        ChatCompletionRequestMessage::User(user) => user,
        other => return serde_json::to_value(other).map_err(|e| CoreError::BadRequest(e.to_string())),
    };

    let content = match user.content {
        ChatCompletionUserContent::Text(text) => Value::String(text),
        ChatCompletionUserContent::Parts(parts) => {
            let mut rewritten_parts = Vec::with_capacity(parts.len());
            for part in parts {
                match part {
                    ChatCompletionUserContentPart::ImageUrl { image_url } => {
                        rewritten_parts.push(inline_one_attachment(http, cookie, &image_url.url).await?);
                    }
                    other => {
                        rewritten_parts.push(serde_json::to_value(other).map_err(|e| CoreError::BadRequest(e.to_string()))?)
                    }
                }
            }
            Value::Array(rewritten_parts)
        }
    };
    Ok(json!({"role": "user", "content": content}))
}

async fn inline_one_attachment(http: &UpstreamHttpClient, cookie: &str, url: &str) -> Result<Value, CoreError> {
    let bytes = if let Some(rest) = url.strip_prefix("data:") {
        decode_data_url(rest)?
    } else if url.starts_with("http://") || url.starts_with("https://") {
        let (status, body) = http
            .do_request(Method::GET, url, cookie, &[], None)
            .await
            .map_err(|_| CoreError::BadRequest("failed to fetch image_url attachment".to_string()))?;
        if status >= 400 {
            return Err(CoreError::BadRequest(format!("attachment fetch returned status {status}")));
        }
        body.to_vec()
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(url)
            .map_err(|_| CoreError::BadRequest("attachment is neither a URL nor valid base64".to_string()))?
    };

    if sniff_is_image(&bytes) {
        let mime = sniff_mime(&bytes);
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        return Ok(json!({
            "type": "image_url",
            "image_url": { "url": format!("data:{mime};base64,{encoded}") }
        }));
    }

    let handshake_url = format!("https://www.genspark.ai{UPLOAD_HANDSHAKE_PATH}");
    let (status, body) = http
        .do_request(Method::GET, &handshake_url, cookie, &[], None)
        .await
        .map_err(|_| CoreError::BadRequest("upload handshake request failed".to_string()))?;
    if status >= 400 {
        return Err(CoreError::BadRequest(format!("upload handshake returned status {status}")));
    }
    let handshake: Value =
        serde_json::from_slice(&body).map_err(|_| CoreError::BadRequest("upload handshake returned malformed JSON".to_string()))?;
    let upload_url = handshake
        .get("upload_image_url")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::BadRequest("upload handshake missing upload_image_url".to_string()))?;
    let storage_url = handshake
        .get("private_storage_url")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::BadRequest("upload handshake missing private_storage_url".to_string()))?;

    let put_headers: [(&str, &str); 1] = [("x-ms-blob-type", "BlockBlob")];
    let (put_status, _) = http
        .do_request(Method::PUT, upload_url, cookie, &put_headers, Some(bytes.clone()))
        .await
        .map_err(|_| CoreError::BadRequest("attachment upload failed".to_string()))?;
    if put_status >= 400 {
        return Err(CoreError::BadRequest(format!("attachment upload returned status {put_status}")));
    }

    Ok(json!({
        "type": "private_file",
        "private_file": {
            "name": "attachment",
            "type": sniff_mime(&bytes),
            "size": bytes.len(),
            "ext": extension_for(&bytes),
            "private_storage_url": storage_url,
        }
    }))
}

fn decode_data_url(rest: &str) -> Result<Vec<u8>, CoreError> {
    let (_meta, payload) = rest
        .split_once(",")
        .ok_or_else(|| CoreError::BadRequest("malformed data URL".to_string()))?;
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|_| CoreError::BadRequest("malformed base64 in data URL".to_string()))
}

fn sniff_is_image(bytes: &[u8]) -> bool {
    sniff_mime(bytes).starts_with("image/")
}

pub(crate) fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if bytes.starts_with(b"\xff\xd8\xff") {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

fn extension_for(bytes: &[u8]) -> &'static str {
    match sniff_mime(bytes) {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
}

fn apply_system_rewrite(messages: &mut [Value], model: &str) {
    for message in messages.iter_mut() {
        let Some(obj) = message.as_object_mut() else { continue };
        match obj.get("role").and_then(Value::as_str) {
            Some("system") => {
                obj.insert("role".to_string(), Value::String("user".to_string()));
            }
            Some("assistant") => {
                obj.insert(
                    "session_state".to_string(),
                    json!({ "models": [model] }),
                );
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_png_magic_bytes() {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(sniff_mime(&bytes), "image/png");
        assert!(sniff_is_image(&bytes));
    }

    #[test]
    fn non_image_bytes_are_not_sniffed_as_images() {
        assert!(!sniff_is_image(b"hello world"));
    }

    #[test]
    fn system_rewrite_converts_role_and_stamps_assistant_hint() {
        let mut messages = vec![json!({"role": "system", "content": "be nice"}), json!({"role": "assistant", "content": "ok"})];
        apply_system_rewrite(&mut messages, "deepseek-r1");
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["session_state"]["models"][0], "deepseek-r1");
    }
}
