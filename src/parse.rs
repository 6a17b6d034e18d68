//! Decoding of the API's `{"data": ...}` envelopes.

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;

use crate::{Error, Result};

/// First listing page as reported by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo {
    /// Items on a single page.
    pub page_size: u64,
    /// Items across the whole listing.
    pub total: u64,
}

impl PageInfo {
    /// Number of pages needed to cover `total`, rounding up.
    pub fn page_count(&self) -> u64 {
        if self.page_size == 0 {
            0
        } else {
            self.total.div_ceil(self.page_size)
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct CategoryData {
    items: Vec<BookItem>,
    total: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookItem {
    #[serde(deserialize_with = "flexible_int")]
    book_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChapterListData {
    comic_chapters: Vec<ChapterItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChapterItem {
    #[serde(deserialize_with = "flexible_int")]
    chapter_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentData {
    chapter_info: ChapterInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChapterInfo {
    #[serde(deserialize_with = "flexible_int")]
    publish_time: i64,
}

/// Ids come back as numbers on some endpoints and as decimal strings on others.
fn flexible_int<'de, D>(deserializer: D) -> core::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(n) => Ok(n),
        IntOrString::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("expected an integer, found {s:?}"))),
    }
}

fn decode<T: DeserializeOwned>(body: &str, operation: &str) -> Result<T> {
    serde_json::from_str::<Envelope<T>>(body)
        .map(|envelope| envelope.data)
        .map_err(|err| Error::MalformedResponse {
            operation: operation.to_string(),
            reason: err.to_string(),
        })
}

pub fn parse_page_info(body: &str, operation: &str) -> Result<PageInfo> {
    let data: CategoryData = decode(body, operation)?;
    Ok(PageInfo {
        page_size: data.items.len() as u64,
        total: data.total,
    })
}

pub fn parse_comic_ids(body: &str, operation: &str) -> Result<Vec<i64>> {
    let data: CategoryData = decode(body, operation)?;
    Ok(data.items.into_iter().map(|item| item.book_id).collect())
}

pub fn parse_chapter_ids(body: &str, operation: &str) -> Result<Vec<i64>> {
    let data: ChapterListData = decode(body, operation)?;
    Ok(data
        .comic_chapters
        .into_iter()
        .map(|chapter| chapter.chapter_id)
        .collect())
}

pub fn parse_publish_time(body: &str, operation: &str) -> Result<i64> {
    let data: ContentData = decode(body, operation)?;
    Ok(data.chapter_info.publish_time)
}
