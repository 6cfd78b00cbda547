use gatehouse_core::error::GatewayError;
use gatehouse_core::route::RouteRule;
use gatehouse_core::router::Router;
use std::sync::Arc;

// =============================================================================
// Helper Functions
// =============================================================================

fn rule(path: &str, service: &str) -> RouteRule {
    RouteRule::new(path, service, false)
}

fn default_table() -> Vec<RouteRule> {
    vec![
        rule("/api/auth/*", "auth"),
        RouteRule::new("/api/users/*", "user", true),
        RouteRule::new("/api/orders/*", "order", true),
        RouteRule::new("/api/cart/*", "cart", true),
        rule("/api/products/*", "product"),
    ]
}

fn service_for(router: &Router, path: &str) -> Option<String> {
    router.match_path(path).map(|r| r.service.clone())
}

// =============================================================================
// Basic Router Tests
// =============================================================================

#[test]
fn test_build_counts_routes() {
    let router = Router::build(default_table()).unwrap();
    assert_eq!(router.route_count(), 5);
}

#[test]
fn test_build_rejects_invalid_pattern() {
    let result = Router::build(vec![rule("api/no-slash", "x")]);
    assert!(matches!(result, Err(GatewayError::ConfigValidation(_))));
}

// =============================================================================
// Matching Tests
// =============================================================================

#[test]
fn test_match_wildcard_subtree() {
    let router = Router::build(default_table()).unwrap();
    assert_eq!(service_for(&router, "/api/orders/42").as_deref(), Some("order"));
    assert_eq!(service_for(&router, "/api/cart/items/7").as_deref(), Some("cart"));
    assert_eq!(service_for(&router, "/api/auth/login").as_deref(), Some("auth"));
}

#[test]
fn test_match_bare_prefix() {
    let router = Router::build(default_table()).unwrap();
    assert_eq!(service_for(&router, "/api/orders").as_deref(), Some("order"));
}

#[test]
fn test_no_match_unknown_path() {
    let router = Router::build(default_table()).unwrap();
    assert!(router.match_path("/api/unknown").is_none());
    assert!(router.match_path("/").is_none());
    assert!(router.match_path("/api/ordersx").is_none());
}

#[test]
fn test_auth_flag_travels_with_rule() {
    let router = Router::build(default_table()).unwrap();
    assert!(router.match_path("/api/orders/1").unwrap().auth_required);
    assert!(!router.match_path("/api/products").unwrap().auth_required);
}

// =============================================================================
// Specificity Tests
// =============================================================================

#[test]
fn test_longer_prefix_wins_regardless_of_order() {
    let router = Router::build(vec![
        rule("/api/*", "catch-all"),
        rule("/api/orders/*", "order"),
        rule("/api/orders/archive/*", "archive"),
    ])
    .unwrap();

    assert_eq!(service_for(&router, "/api/orders/archive/2019").as_deref(), Some("archive"));
    assert_eq!(service_for(&router, "/api/orders/1").as_deref(), Some("order"));
    assert_eq!(service_for(&router, "/api/other").as_deref(), Some("catch-all"));
}

#[test]
fn test_exact_beats_wildcard() {
    let router = Router::build(vec![
        rule("/api/auth/*", "auth"),
        rule("/api/auth/login", "login"),
    ])
    .unwrap();

    assert_eq!(service_for(&router, "/api/auth/login").as_deref(), Some("login"));
    assert_eq!(service_for(&router, "/api/auth/logout").as_deref(), Some("auth"));
}

#[test]
fn test_slash_wildcard_outranks_loose_wildcard() {
    // same rules in both orders: config order must not decide
    for rules in [
        vec![rule("/api/orders*", "loose"), rule("/api/orders/*", "subtree")],
        vec![rule("/api/orders/*", "subtree"), rule("/api/orders*", "loose")],
    ] {
        let router = Router::build(rules).unwrap();
        assert_eq!(service_for(&router, "/api/orders/1").as_deref(), Some("subtree"));
        assert_eq!(service_for(&router, "/api/ordersx").as_deref(), Some("loose"));
        assert_eq!(router.rules()[0].service, "subtree");
    }
}

#[test]
fn test_exact_beats_bare_wildcard_match() {
    let router = Router::build(vec![rule("/api/cart/*", "cart"), rule("/api/cart", "cart-root")]).unwrap();
    assert_eq!(service_for(&router, "/api/cart").as_deref(), Some("cart-root"));
    assert_eq!(service_for(&router, "/api/cart/1").as_deref(), Some("cart"));
}

#[test]
fn test_rules_listed_in_precedence_order() {
    let router = Router::build(vec![rule("/*", "root"), rule("/api/orders/*", "order")]).unwrap();
    let rules = router.rules();
    assert_eq!(rules[0].service, "order");
    assert_eq!(rules[1].service, "root");
}

// =============================================================================
// Reload Tests
// =============================================================================

#[test]
fn test_reload_swaps_table() {
    let router = Router::build(default_table()).unwrap();
    router
        .reload(vec![rule("/api/orders/*", "order-v2")])
        .unwrap();
    assert_eq!(router.route_count(), 1);
    assert_eq!(service_for(&router, "/api/orders/1").as_deref(), Some("order-v2"));
    assert!(router.match_path("/api/cart/1").is_none());
}

#[test]
fn test_failed_reload_keeps_old_table() {
    let router = Router::build(default_table()).unwrap();
    let err = router.reload(vec![rule("/a/*", "x"), rule("/a/*", "y")]);
    assert!(err.is_err());
    assert_eq!(router.route_count(), 5);
    assert_eq!(service_for(&router, "/api/cart").as_deref(), Some("cart"));
}

#[test]
fn test_concurrent_matching_during_reload() {
    let router = Arc::new(Router::build(default_table()).unwrap());
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let router = Arc::clone(&router);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let svc = service_for(&router, "/api/orders/1").unwrap();
                    assert!(svc == "order" || svc == "order-v2");
                }
            })
        })
        .collect();

    for i in 0..100 {
        let target = if i % 2 == 0 { "order-v2" } else { "order" };
        router
            .reload(vec![RouteRule::new("/api/orders/*", target, true)])
            .unwrap();
    }
    for r in readers {
        r.join().unwrap();
    }
}
