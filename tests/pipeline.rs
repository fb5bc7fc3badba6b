use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use serde_json::{json, Value};
use tower::ServiceExt;

use comparables::catalog::CatalogClient;
use comparables::geo::{GeoResolver, Geocoder, NominatimGeocoder};
use comparables::jobs::JobService;
use comparables::ranking::{EngineOptions, RecommendationEngine};
use comparables::{build_router, AppConfig, AppState};

fn listing(id: u32, location: &str, bedrooms: &str, price: u32, lat: f64, lon: f64) -> Value {
    json!({
        "id": id,
        "name": format!("Departamento {id}"),
        "location": location,
        "bedrooms": bedrooms,
        "price": price.to_string(),
        "lat": lat,
        "lon": lon,
        "url": format!("https://portal.example/{id}")
    })
}

fn app(geo_server: &Server, catalog_server: &Server) -> Router {
    let provider = NominatimGeocoder::new(
        &geo_server.url("/search").to_string(),
        "comparables-tests",
        Duration::from_secs(5),
    )
    .unwrap();
    let resolver = GeoResolver::with_provider(Arc::new(provider), 64, Duration::ZERO);
    let geocoder: Arc<dyn Geocoder> = Arc::new(resolver);

    let engine = RecommendationEngine::new(geocoder.clone(), EngineOptions::default());
    let catalog = CatalogClient::new(&catalog_server.url("/").to_string(), None).unwrap();
    let jobs = JobService::start(engine, Arc::new(catalog), 500, 2);

    build_router(Arc::new(AppState {
        config: AppConfig::default(),
        geocoder,
        jobs,
    }))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn submit(app: &Router, property: Value) -> String {
    let request = Request::post("/job")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "property": property }).to_string()))
        .unwrap();
    let (status, body) = send(app, request).await;
    assert_eq!(status, StatusCode::OK, "unexpected body {body}");
    body["job_id"].as_str().unwrap().to_string()
}

async fn wait_for_job(app: &Router, job_id: &str) -> Value {
    for _ in 0..200 {
        let request = Request::get(format!("/job/{job_id}"))
            .body(Body::empty())
            .unwrap();
        let (_, body) = send(app, request).await;
        if body["status"] == "success" || body["status"] == "failure" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never finished");
}

#[tokio::test]
async fn submitted_property_receives_nearest_comparables() {
    let geo_server = Server::run();
    geo_server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", "Ñuñoa")))),
        ])
        .times(1)
        .respond_with(json_encoded(json!([{ "lat": "-33.4569", "lon": "-70.5975" }]))),
    );

    let catalog_server = Server::run();
    catalog_server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/properties/internal"),
            request::query(url_decoded(contains(("page", "1")))),
        ])
        .times(1)
        .respond_with(json_encoded(json!({
            "results": [
                listing(14, "Irarrázaval 3000, Ñuñoa", "2", 250_000, -33.5000, -70.5975),
                listing(20, "Ñuñoa", "2", 450_000, -33.4569, -70.5976),
                listing(11, "Plaza Ñuñoa, Ñuñoa", "2 dormitorios", 390_000, -33.4570, -70.5980),
                listing(21, "Providencia", "2", 200_000, -33.4260, -70.6170),
                listing(13, "Ñuñoa", "2", 300_000, -33.4700, -70.5975),
                listing(22, "Ñuñoa", "3", 310_000, -33.4571, -70.5975),
                "not a listing",
                listing(12, "Villa Frei, Ñuñoa", "2", 350_000, -33.4600, -70.5975),
            ]
        }))),
    );

    let app = app(&geo_server, &catalog_server);
    let job_id = submit(
        &app,
        json!({
            "property_id": "base-1",
            "titulo": "Depto en Ñuñoa",
            "comuna": "Ñuñoa",
            "dormitorios": "2",
            "precio": 400000
        }),
    )
    .await;

    let job = wait_for_job(&app, &job_id).await;
    assert_eq!(job["status"], "success");

    let result = &job["result"];
    assert_eq!(result["message"], "ok");
    assert_eq!(result["tier"], "strict");
    let ids: Vec<&str> = result["recommendations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["11", "12", "13"]);

    let nearest = &result["recommendations"][0];
    assert_eq!(nearest["comuna"], "Ñuñoa");
    assert_eq!(nearest["bedrooms"], 2);
    assert_eq!(nearest["url"], "https://portal.example/11");
    assert!(nearest["distance_km"].as_f64().unwrap() < 0.1);
}

#[tokio::test]
async fn catalog_outage_surfaces_as_failed_job() {
    let geo_server = Server::run();
    let catalog_server = Server::run();
    catalog_server.expect(
        Expectation::matching(request::method_path("GET", "/properties/internal"))
            .respond_with(status_code(503)),
    );

    let app = app(&geo_server, &catalog_server);
    let job_id = submit(
        &app,
        json!({
            "comuna": "Ñuñoa",
            "dormitorios": 2,
            "precio": 400000,
            "lat": -33.45,
            "lon": -70.6
        }),
    )
    .await;

    let job = wait_for_job(&app, &job_id).await;
    assert_eq!(job["status"], "failure");
    assert!(job["result"].is_null());
    assert!(job["error"].as_str().unwrap().contains("503"));
}

#[tokio::test]
async fn unrecognised_comuna_yields_no_matches() {
    let geo_server = Server::run();
    geo_server.expect(
        Expectation::matching(request::method_path("GET", "/search"))
            .respond_with(json_encoded(json!([]))),
    );
    let catalog_server = Server::run();
    catalog_server.expect(
        Expectation::matching(request::method_path("GET", "/properties/internal"))
            .respond_with(json_encoded(json!([
                listing(1, "Ñuñoa", "2", 100_000, -33.45, -70.60),
            ]))),
    );

    let app = app(&geo_server, &catalog_server);
    let job_id = submit(&app, json!({ "titulo": "Casa en la playa", "precio": 90000 })).await;

    let job = wait_for_job(&app, &job_id).await;
    assert_eq!(job["status"], "success");
    assert_eq!(
        job["result"],
        json!({ "message": "no_matches", "recommendations": [] })
    );
}

#[tokio::test]
async fn catalog_body_without_listings_fails_the_job() {
    let geo_server = Server::run();
    let catalog_server = Server::run();
    catalog_server.expect(
        Expectation::matching(request::method_path("GET", "/properties/internal"))
            .respond_with(json_encoded(json!({ "error": "maintenance" }))),
    );

    let app = app(&geo_server, &catalog_server);
    let job_id = submit(
        &app,
        json!({ "comuna": "Ñuñoa", "dormitorios": 2, "lat": -33.45, "lon": -70.6 }),
    )
    .await;

    let job = wait_for_job(&app, &job_id).await;
    assert_eq!(job["status"], "failure");
    assert!(job["result"].is_null());
}

#[tokio::test]
async fn heartbeat_reports_built_in_configuration() {
    let app = app(&Server::run(), &Server::run());
    let request = Request::get("/heartbeat").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["config"]["geocode_provider"], "nominatim");
    assert_eq!(body["config"]["has_catalog_credentials"], false);
    assert_eq!(body["config"]["worker_count"], 4);
}
