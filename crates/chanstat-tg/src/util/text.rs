/// Telegram rejects messages longer than 4096 characters, we keep some
/// room for the markup around the chunks.
pub(crate) const MAX_MESSAGE_CHARS: usize = 4000;

/// Groups the lines into chunks where each chunk has at most `max_chars`
/// characters (including the newlines between the lines).
///
/// A single line longer than `max_chars` is split at char boundaries.
pub(crate) fn chunk_lines<'a>(
    lines: impl IntoIterator<Item = &'a str>,
    max_chars: usize,
) -> Vec<String> {
    let mut chunks = vec![];
    let mut current = String::new();
    let mut current_chars = 0;

    let mut push_piece = |piece: &str, chunks: &mut Vec<String>| {
        let piece_chars = piece.chars().count();
        let separator = usize::from(!current.is_empty());

        if current_chars + separator + piece_chars > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        if !current.is_empty() {
            current.push('\n');
            current_chars += 1;
        }
        current.push_str(piece);
        current_chars += piece_chars;
    };

    for line in lines {
        if line.chars().count() <= max_chars {
            push_piece(line, &mut chunks);
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        for piece in chars.chunks(max_chars) {
            push_piece(&piece.iter().collect::<String>(), &mut chunks);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}
