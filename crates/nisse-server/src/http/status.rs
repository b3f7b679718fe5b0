//! Response status carried through request processing.

/// Status that starts as `200 OK` and freezes on the first failure: once a
/// check has recorded a non-200 code, later failures cannot overwrite it.
#[derive(Clone, Debug)]
pub struct Status {
    code: u16,
    message: &'static str,
    information: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: 200,
            message: "OK",
            information: String::new(),
        }
    }

    /// Record a failure unless one is already recorded.
    pub fn fail(&mut self, code: u16, message: &'static str, information: String) {
        if self.code == 200 {
            self.code = code;
            self.message = message;
            self.information = information;
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 200
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// Short reason phrase, e.g. `Not Found`.
    pub fn message(&self) -> &'static str {
        self.message
    }

    /// Human-oriented diagnostic, sent back in the `message:` header.
    pub fn information(&self) -> &str {
        &self.information
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_wins() {
        let mut status = Status::ok();
        assert!(status.is_ok());

        status.fail(404, "Not Found", "nothing here".into());
        status.fail(400, "Bad Request", "should not replace".into());

        assert_eq!(status.code(), 404);
        assert_eq!(status.message(), "Not Found");
        assert_eq!(status.information(), "nothing here");
    }
}
