use crate::error::RawError;
use crate::{InputFile, JobKind, ProcessingOptions};

const PDF_MAGIC: &[u8] = b"%PDF-";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub max_file_size: u64,
    pub allowed_extensions: Vec<String>,
    pub check_signature: bool,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            allowed_extensions: vec!["pdf".to_string(), "docx".to_string()],
            check_signature: true,
        }
    }
}

/// Checks a submission before any job is dispatched.
pub fn validate(
    file: &InputFile,
    kind: JobKind,
    options: &ProcessingOptions,
    rules: &ValidationRules,
) -> Result<(), RawError> {
    check_file(file, rules)?;

    if kind == JobKind::Merge {
        if options.merge_with.is_empty() {
            return Err(RawError::validation("merge needs at least two documents"));
        }
        for extra in &options.merge_with {
            check_file(extra, rules)?;
        }
        let total: u64 = file.size() + options.merge_with.iter().map(InputFile::size).sum::<u64>();
        if total > rules.max_file_size {
            return Err(RawError::validation(format!(
                "merged inputs total {total} bytes, limit is {} bytes",
                rules.max_file_size
            ))
            .with_status(413));
        }
    }

    if let Some(level) = options.compression_level {
        if !(1..=9).contains(&level) {
            return Err(RawError::validation(format!(
                "compression level {level} is outside 1-9"
            )));
        }
    }
    Ok(())
}

fn check_file(file: &InputFile, rules: &ValidationRules) -> Result<(), RawError> {
    if file.data.is_empty() {
        return Err(RawError::validation(format!("{} is empty", file.name)));
    }

    let extension = file.extension().unwrap_or_default();
    if !rules.allowed_extensions.iter().any(|allowed| *allowed == extension) {
        return Err(RawError::validation(format!(
            "{} has an unsupported type; allowed: {}",
            file.name,
            rules.allowed_extensions.join(", ")
        ))
        .with_status(415));
    }

    if file.size() > rules.max_file_size {
        return Err(RawError::validation(format!(
            "{} is {} bytes, limit is {} bytes",
            file.name,
            file.size(),
            rules.max_file_size
        ))
        .with_status(413));
    }

    if rules.check_signature {
        let magic = match extension.as_str() {
            "pdf" => Some(PDF_MAGIC),
            "docx" => Some(ZIP_MAGIC),
            _ => None,
        };
        if let Some(magic) = magic {
            if !file.data.starts_with(magic) {
                return Err(RawError::validation(format!(
                    "{} does not look like a .{extension} file",
                    file.name
                ))
                .with_status(415));
            }
        }
    }
    Ok(())
}
