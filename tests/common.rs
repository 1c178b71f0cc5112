use httptest::{matchers::request, responders::status_code, Expectation, Server};
use tonga::TongaClient;

pub fn server_url(server: &Server) -> String {
    format!("http://{}", server.addr())
}

pub fn create_client(server: &Server) -> TongaClient {
    TongaClient::new(server_url(server)).expect("should be able to create tonga client")
}

/// Allows any number of analytics reports, for tests that only care about
/// flag resolution. Tests asserting on analytics traffic set up their own
/// exact-count expectations instead.
pub fn allow_analytics_reports(server: &Server) {
    server.expect(
        Expectation::matching(request::method_path("POST", "/update_analytics"))
            .times(..)
            .respond_with(status_code(200)),
    );
}
