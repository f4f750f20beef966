use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use zhconv::{zhconv, Variant};

use crate::languages::canonical_name;
use crate::{HubError, Result};

/// Script normalization applied to the artifacts of some languages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptConversion {
    SerbianCyrillicToLatin,
    ChineseTraditionalToSimplified,
}

impl ScriptConversion {
    /// The conversion a resolved language needs, if any
    pub fn for_language(language: &str) -> Option<Self> {
        match canonical_name(language)? {
            "Serbian" => Some(ScriptConversion::SerbianCyrillicToLatin),
            "Chinese" => Some(ScriptConversion::ChineseTraditionalToSimplified),
            _ => None,
        }
    }
}

#[async_trait]
pub trait ScriptConverter: Send + Sync {
    async fn convert(&self, conversion: ScriptConversion, text: &str) -> Result<String>;
}

/// Serbian through a built-in table, Chinese through `zhconv`
///
/// An external `opencc` command can replace `zhconv` for Chinese.
#[derive(Debug, Clone, Default)]
pub struct BuiltinConverter {
    /// Command reading Traditional Chinese on stdin, e.g. `opencc -c t2s.json`
    opencc_command: Option<Vec<String>>,
}

impl BuiltinConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_opencc(mut self, command: &str) -> Self {
        let parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        self.opencc_command = if parts.is_empty() { None } else { Some(parts) };
        self
    }

    async fn to_simplified(&self, text: &str) -> Result<String> {
        match self.opencc_command.as_deref().and_then(<[String]>::split_first) {
            Some((program, args)) => run_opencc(program, args, text).await,
            None => Ok(zhconv(text, Variant::ZhHans)),
        }
    }
}

async fn run_opencc(program: &str, args: &[String], text: &str) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(HubError::pipeline("normalize-script"))?;

    let mut stdin = child.stdin.take().ok_or_else(|| {
        HubError::pipeline("normalize-script")(std::io::Error::other("opencc stdin not captured"))
    })?;
    let input = text.as_bytes().to_vec();
    let writer = tokio::spawn(async move {
        stdin.write_all(&input).await?;
        stdin.shutdown().await
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(HubError::pipeline("normalize-script"))?;
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(HubError::pipeline("normalize-script")(e)),
        Err(e) => return Err(HubError::pipeline("normalize-script")(std::io::Error::other(e))),
    }

    if !output.status.success() {
        return Err(HubError::pipeline("normalize-script")(std::io::Error::other(format!(
            "opencc exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))));
    }

    debug!("opencc converted {} bytes", output.stdout.len());
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[async_trait]
impl ScriptConverter for BuiltinConverter {
    async fn convert(&self, conversion: ScriptConversion, text: &str) -> Result<String> {
        match conversion {
            ScriptConversion::SerbianCyrillicToLatin => Ok(serbian_to_latin(text)),
            ScriptConversion::ChineseTraditionalToSimplified => self.to_simplified(text).await,
        }
    }
}

/// Transliterate Serbian Cyrillic to Gaj's Latin alphabet
pub fn serbian_to_latin(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        let Some(latin) = cyrillic_letter(c) else {
            out.push(c);
            continue;
        };

        // Title-case digraphs unless the next letter is upper case too
        let next_is_upper = chars.peek().map(|n| n.is_uppercase()).unwrap_or(false);
        if latin.chars().count() > 1 && c.is_uppercase() && !next_is_upper {
            let mut parts = latin.chars();
            if let Some(first) = parts.next() {
                out.push(first);
                out.extend(parts.flat_map(char::to_lowercase));
            }
        } else {
            out.push_str(latin);
        }
    }
    out
}

#[rustfmt::skip]
fn cyrillic_letter(c: char) -> Option<&'static str> {
    let latin = match c {
        'А' => "A", 'а' => "a",
        'Б' => "B", 'б' => "b",
        'В' => "V", 'в' => "v",
        'Г' => "G", 'г' => "g",
        'Д' => "D", 'д' => "d",
        'Ђ' => "Đ", 'ђ' => "đ",
        'Е' => "E", 'е' => "e",
        'Ж' => "Ž", 'ж' => "ž",
        'З' => "Z", 'з' => "z",
        'И' => "I", 'и' => "i",
        'Ј' => "J", 'ј' => "j",
        'К' => "K", 'к' => "k",
        'Л' => "L", 'л' => "l",
        'Љ' => "LJ", 'љ' => "lj",
        'М' => "M", 'м' => "m",
        'Н' => "N", 'н' => "n",
        'Њ' => "NJ", 'њ' => "nj",
        'О' => "O", 'о' => "o",
        'П' => "P", 'п' => "p",
        'Р' => "R", 'р' => "r",
        'С' => "S", 'с' => "s",
        'Т' => "T", 'т' => "t",
        'Ћ' => "Ć", 'ћ' => "ć",
        'У' => "U", 'у' => "u",
        'Ф' => "F", 'ф' => "f",
        'Х' => "H", 'х' => "h",
        'Ц' => "C", 'ц' => "c",
        'Ч' => "Č", 'ч' => "č",
        'Џ' => "DŽ", 'џ' => "dž",
        'Ш' => "Š", 'ш' => "š",
        _ => return None,
    };
    Some(latin)
}
