//! Record bodies: one JSON object per record, one record per line for lists.

use serde::{de::DeserializeOwned, Serialize};

pub fn encode<T: Serialize>(record: &T) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(record)
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> serde_json::Result<T> {
    serde_json::from_slice(body)
}

pub fn encode_list<'a, T, I>(records: I) -> serde_json::Result<Vec<u8>>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut out = Vec::new();
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.push(b'\n');
    }
    Ok(out)
}

pub fn decode_list<T: DeserializeOwned>(body: &[u8]) -> serde_json::Result<Vec<T>> {
    body.split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(serde_json::from_slice)
        .collect()
}
