use chrono::{Duration, TimeZone, Utc};
use keel_converge::manifest::{ManifestQuantity, ManifestResources};
use keel_converge::{converge_pod, converge_template, DiffSummary, ManifestContainer, ManifestTemplate, PodManifest};
use keel_core::{ContainerImage, ContainerVolume, Pod, SpecTemplate, SpecTemplateVolume, VolumeBind, VolumeSource};

fn container(name: &str, image: &str) -> ManifestContainer {
    ManifestContainer {
        name: name.into(),
        image: ContainerImage { name: image.into(), secret: String::new() },
        ..Default::default()
    }
}

fn template(containers: Vec<ManifestContainer>, volumes: Vec<SpecTemplateVolume>) -> ManifestTemplate {
    ManifestTemplate { containers, volumes }
}

fn bind(key: &str, file: &str) -> VolumeBind {
    VolumeBind { key: key.into(), file: file.into() }
}

fn secret_volume(binds: Vec<VolumeBind>) -> SpecTemplateVolume {
    SpecTemplateVolume {
        name: "creds".into(),
        kind: "secret".into(),
        secret: VolumeSource { name: "db".into(), binds },
        config: VolumeSource::default(),
    }
}

fn rich() -> ManifestTemplate {
    let mut c = container("app", "nginx:1.25");
    c.command = "nginx -g daemon".into();
    c.args = vec!["--port".into(), "80".into()];
    c.resources = ManifestResources {
        request: ManifestQuantity { ram: "512Mi".into(), cpu: "250m".into() },
        limits: ManifestQuantity { ram: "1Gi".into(), cpu: "1".into() },
    };
    c.volumes = vec![ContainerVolume { name: "creds".into(), mode: "ro".into(), path: "/run/creds".into() }];
    template(vec![c, container("sidecar", "envoy")], vec![secret_volume(vec![bind("k1", "f1")])])
}

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

#[test]
fn second_pass_is_a_no_op() {
    let mut s = DiffSummary::default();
    let (first, changed) = converge_template(&rich(), &SpecTemplate::default(), t0(), &mut s);
    assert!(changed);
    assert_eq!(first.updated, t0());

    let later = t0() + Duration::seconds(30);
    let mut s = DiffSummary::default();
    let (second, changed) = converge_template(&rich(), &first, later, &mut s);
    assert!(!changed);
    assert_eq!(second, first);
    assert_eq!(s, DiffSummary::default());
}

#[test]
fn add_into_empty() {
    let mut s = DiffSummary::default();
    let (out, changed) = converge_template(&template(vec![container("a", "x")], vec![]), &SpecTemplate::default(), t0(), &mut s);
    assert!(changed);
    assert_eq!(out.containers.len(), 1);
    assert_eq!(out.containers[0].name, "a");
}

#[test]
fn prune_drops_undesired() {
    let mut s = DiffSummary::default();
    let (both, _) = converge_template(
        &template(vec![container("a", "x"), container("b", "x")], vec![]),
        &SpecTemplate::default(),
        t0(),
        &mut s,
    );
    let later = t0() + Duration::seconds(1);
    let mut s = DiffSummary::default();
    let (out, changed) = converge_template(&template(vec![container("a", "x")], vec![]), &both, later, &mut s);
    assert!(changed);
    assert_eq!(out.containers.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), vec!["a"]);
    assert_eq!(s.removes, 1);
    assert_eq!(out.updated, later);
}

#[test]
fn equal_tracked_fields_do_not_change() {
    let desired = template(vec![container("a", "x")], vec![]);
    let mut s = DiffSummary::default();
    let (mut live, _) = converge_template(&desired, &SpecTemplate::default(), t0(), &mut s);
    // untracked field on the live side
    live.containers[0].labels.insert("team".into(), "edge".into());
    let (out, changed) = converge_template(&desired, &live, t0() + Duration::seconds(5), &mut s);
    assert!(!changed);
    assert_eq!(out.containers[0].labels.get("team").map(String::as_str), Some("edge"));
    assert_eq!(out.updated, t0());
}

#[test]
fn bind_set_is_replaced_as_a_whole() {
    let mut s = DiffSummary::default();
    let (live, _) = converge_template(&template(vec![], vec![secret_volume(vec![bind("k1", "f1")])]), &SpecTemplate::default(), t0(), &mut s);

    let grown = template(vec![], vec![secret_volume(vec![bind("k1", "f1"), bind("k2", "f2")])]);
    let (out, changed) = converge_template(&grown, &live, t0() + Duration::seconds(1), &mut s);
    assert!(changed);
    assert_eq!(out.volumes[0].secret.binds, vec![bind("k1", "f1"), bind("k2", "f2")]);

    let same = template(vec![], vec![secret_volume(vec![bind("k1", "f1")])]);
    let (_, changed) = converge_template(&same, &live, t0() + Duration::seconds(2), &mut s);
    assert!(!changed);
}

#[test]
fn quantities_compare_decoded() {
    let mut m = PodManifest::default();
    let mut c = container("a", "x");
    c.resources.request = ManifestQuantity { ram: "512Mi".into(), cpu: "1000m".into() };
    m.spec.template = Some(template(vec![c.clone()], vec![]));
    let first = converge_pod(&Pod::default(), &m, t0());
    assert_eq!(first.value.spec.template.containers[0].resources.request.ram, 536_870_912);

    c.resources.request = ManifestQuantity { ram: "536870912".into(), cpu: "1".into() };
    m.spec.template = Some(template(vec![c], vec![]));
    let second = converge_pod(&first.value, &m, t0() + Duration::seconds(1));
    assert!(!second.changed);
}

#[test]
fn malformed_quantity_degenerates_to_zero() {
    let mut m = PodManifest::default();
    let mut c = container("a", "x");
    c.resources.limits = ManifestQuantity { ram: "plenty".into(), cpu: "fast".into() };
    m.spec.template = Some(template(vec![c], vec![]));
    let out = converge_pod(&Pod::default(), &m, t0());
    let limits = out.value.spec.template.containers[0].resources.limits;
    assert_eq!((limits.ram, limits.cpu), (0, 0));
    assert!(!converge_pod(&out.value, &m, t0()).changed);
}
