use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatLumiError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_convert_with_context() {
        let err: ChatLumiError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, ChatLumiError::Database(_)));
        assert!(err.to_string().starts_with("Database error:"));

        let err: ChatLumiError = sqlx::migrate::MigrateError::VersionMissing(42).into();
        assert!(matches!(err, ChatLumiError::Migration(_)));
        assert!(err.to_string().starts_with("Migration error:"));
    }
}
