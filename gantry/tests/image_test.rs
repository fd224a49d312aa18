/// Image resolution and its per-run cache against the in-memory Compute Engine

use std::sync::Arc;
use std::time::Duration;

use gantry::image::{ImageResolver, ImageSelector};
use gantry::{Cloud, Error};
use gantry_cli_test_utils::*;

fn cloud(fake: &Arc<FakeCompute>) -> Cloud {
    Cloud::new(fake.clone(), PROJECT, ZONE, Duration::from_secs(60))
}

fn family(project: &str, family: &str) -> ImageSelector {
    ImageSelector::Family {
        project: Some(project.into()),
        family: family.into(),
    }
}

#[tokio::test]
async fn test_concurrent_hosts_share_one_lookup() {
    let fake = Arc::new(FakeCompute::new());
    let cloud = cloud(&fake);
    let resolver = ImageResolver::new();
    let debian = family("debian-cloud", "debian-12");
    let windows = family("windows-cloud", "windows-2022");

    let (a, b, c) = tokio::join!(
        resolver.resolve(&cloud, &debian),
        resolver.resolve(&cloud, &windows),
        resolver.resolve(&cloud, &debian),
    );

    let a = a.expect("debian should resolve");
    let c = c.expect("debian should resolve");
    assert_eq!(a, c);
    assert_eq!(
        b.expect("windows should resolve").name,
        "windows-server-2022-dc-v20240415"
    );
    assert_eq!(fake.count("get_image_from_family"), 2);
}

#[tokio::test]
async fn test_failed_lookup_is_not_remembered() {
    let fake = Arc::new(FakeCompute::new());
    fake.inject(Fault::http("get_image_from_family", 503, "backend error").on("debian-12").times(1));
    let cloud = cloud(&fake);
    let resolver = ImageResolver::new();
    let debian = family("debian-cloud", "debian-12");

    let err = resolver
        .resolve(&cloud, &debian)
        .await
        .expect_err("the first lookup fails");
    assert!(matches!(err, Error::Api { status: 503, .. }));

    let image = resolver
        .resolve(&cloud, &debian)
        .await
        .expect("the second lookup should reach the api again");
    assert_eq!(image.family.as_deref(), Some("debian-12"));
    assert_eq!(fake.count("get_image_from_family"), 2);

    resolver
        .resolve(&cloud, &debian)
        .await
        .expect("cached answer should be returned");
    assert_eq!(fake.count("get_image_from_family"), 2);
}
