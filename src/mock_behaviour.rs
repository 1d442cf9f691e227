//! This module provides ways to tweak mocked remote stores, so that they can return errors on some tests

use crate::error::{Error, Result};

/// This stores some behaviour tweaks, that describe how a mocked instance will behave during a given test
///
/// So that a functions fails _n_ times after _m_ initial successes, set `(m, n)` for the suited parameter.
/// Failures are transport failures, i.e. the kind of errors a caller is expected to retry.
#[derive(Default, Clone, Debug)]
pub struct MockBehaviour {
    /// If this is true, every action will be allowed
    pub is_suspended: bool,

    pub list_collections_behaviour: (u32, u32),
    pub list_resources_behaviour: (u32, u32),
    pub search_behaviour: (u32, u32),
    pub fetch_behaviour: (u32, u32),
    pub put_behaviour: (u32, u32),
    pub delete_behaviour: (u32, u32),
}

impl MockBehaviour {
    pub fn new() -> Self {
        Self::default()
    }

    /// All operations will fail at once, for `n_fails` times
    pub fn fail_now(n_fails: u32) -> Self {
        Self {
            is_suspended: false,
            list_collections_behaviour: (0, n_fails),
            list_resources_behaviour: (0, n_fails),
            search_behaviour: (0, n_fails),
            fetch_behaviour: (0, n_fails),
            put_behaviour: (0, n_fails),
            delete_behaviour: (0, n_fails),
        }
    }

    /// Suspend this mock behaviour until you call `resume`
    pub fn suspend(&mut self) {
        self.is_suspended = true;
    }
    /// Make this behaviour active again
    pub fn resume(&mut self) {
        self.is_suspended = false;
    }

    pub fn can_list_collections(&mut self) -> Result<()> {
        if self.is_suspended { return Ok(()) }
        decrement(&mut self.list_collections_behaviour, "list_collections")
    }
    pub fn can_list_resources(&mut self) -> Result<()> {
        if self.is_suspended { return Ok(()) }
        decrement(&mut self.list_resources_behaviour, "list_resources")
    }
    pub fn can_search(&mut self) -> Result<()> {
        if self.is_suspended { return Ok(()) }
        decrement(&mut self.search_behaviour, "search")
    }
    pub fn can_fetch(&mut self) -> Result<()> {
        if self.is_suspended { return Ok(()) }
        decrement(&mut self.fetch_behaviour, "fetch")
    }
    pub fn can_put(&mut self) -> Result<()> {
        if self.is_suspended { return Ok(()) }
        decrement(&mut self.put_behaviour, "put")
    }
    pub fn can_delete(&mut self) -> Result<()> {
        if self.is_suspended { return Ok(()) }
        decrement(&mut self.delete_behaviour, "delete")
    }
}


/// Return Ok(()) in case the value is `(1+, _)` or `(_, 0)`, or return Err and decrement otherwise
fn decrement(value: &mut (u32, u32), descr: &str) -> Result<()> {
    let remaining_successes = value.0;
    let remaining_failures = value.1;

    if remaining_successes > 0 {
        value.0 -= 1;
        log::debug!("Mock behaviour: allowing a {} ({:?})", descr, value);
        Ok(())
    } else if remaining_failures > 0 {
        value.1 -= 1;
        log::debug!("Mock behaviour: failing a {} ({:?})", descr, value);
        Err(Error::transport(format!("Mocked behaviour requires this {} to fail this time. ({:?})", descr, value)))
    } else {
        log::debug!("Mock behaviour: allowing a {} ({:?})", descr, value);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mock_behaviour() {
        let mut ok = MockBehaviour::new();
        for _ in 0..5 {
            assert!(ok.can_list_collections().is_ok());
            assert!(ok.can_put().is_ok());
        }

        let mut now = MockBehaviour::fail_now(2);
        assert!(now.can_fetch().is_err());
        assert!(now.can_put().is_err());
        assert!(now.can_put().is_err());
        let err = now.can_fetch().unwrap_err();
        assert!(err.is_retryable());
        assert!(now.can_fetch().is_ok());
        assert!(now.can_put().is_ok());

        let mut custom = MockBehaviour{
            list_resources_behaviour: (0, 1),
            delete_behaviour: (1, 2),
            ..MockBehaviour::default()
        };
        assert!(custom.can_list_resources().is_err());
        assert!(custom.can_list_resources().is_ok());
        assert!(custom.can_delete().is_ok());
        assert!(custom.can_delete().is_err());
        assert!(custom.can_delete().is_err());
        assert!(custom.can_delete().is_ok());

        custom.delete_behaviour = (0, 1);
        custom.suspend();
        assert!(custom.can_delete().is_ok());
        custom.resume();
        assert!(custom.can_delete().is_err());
    }
}
