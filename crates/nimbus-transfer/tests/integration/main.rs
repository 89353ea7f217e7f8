//! Integration tests for nimbus-transfer
//!
//! Uses wiremock to simulate the drive API for the HTTP adapter and the
//! in-memory remote for end-to-end pipeline behaviour.


mod test_http_remote;
