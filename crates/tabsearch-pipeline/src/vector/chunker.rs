//! Fixed-size character windows over row text

/// One window of a row's text, the unit of embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub row_id: i64,
    pub text: String,
}

/// Split `text` into windows of `chunk_size` characters.
///
/// Windows whose trimmed length is below `min_length` are dropped, wherever
/// they fall in the text.
pub fn chunk_text(text: &str, chunk_size: usize, min_length: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_size)
        .map(|window| window.iter().collect::<String>())
        .filter(|window| window.trim().chars().count() >= min_length)
        .collect()
}

/// Chunk every row of a page, keeping the row id on each chunk
pub fn chunk_rows<'a, I>(rows: I, chunk_size: usize, min_length: usize) -> Vec<TextChunk>
where
    I: IntoIterator<Item = (i64, &'a str)>,
{
    rows.into_iter()
        .flat_map(|(row_id, text)| {
            chunk_text(text, chunk_size, min_length)
                .into_iter()
                .map(move |text| TextChunk { row_id, text })
        })
        .collect()
}
