//! Fixed suffix-to-MIME-type table and status reason phrases.

/// Looks up the MIME type for `path` by its last `.suffix`, falling back to
/// `text/plain` for anything unrecognised or suffix-less.
pub fn lookup(path: &str) -> &'static str {
    let Some(pos) = path.rfind('.') else {
        return "text/plain";
    };
    match &path[pos..] {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".doc" => "application/msword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}

pub fn reason_phrase(code: i32) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Bad Request",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_suffix_maps() {
        assert_eq!(lookup("/a/b.css"), "text/css");
        assert_eq!(lookup("index.html"), "text/html");
    }

    #[test]
    fn unknown_suffix_falls_back_to_plain_text() {
        assert_eq!(lookup("README"), "text/plain");
        assert_eq!(lookup("archive.rar"), "text/plain");
    }
}
