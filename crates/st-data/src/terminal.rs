/// Collapse terminal redraws in captured output.
///
/// Progress bars redraw a line with bare `\r`; only the last non-empty
/// redraw of each line is kept, `\r\n` endings become `\n`, and empty lines
/// are dropped.
pub fn normalize_terminal_output(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for line in raw.split('\n') {
        let line = line.trim_end_matches('\r');
        let last = line
            .rsplit('\r')
            .find(|segment| !segment.is_empty())
            .unwrap_or("");
        if last.is_empty() {
            continue;
        }
        out.push_str(last);
        out.push('\n');
    }
    out
}
