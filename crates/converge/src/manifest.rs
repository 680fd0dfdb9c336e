//! Desired-state documents as submitted by users, decoded from JSON or YAML.

use std::collections::{BTreeMap, HashSet};

use keel_core::{
    ContainerEnv, ContainerImage, ContainerPort, ContainerVolume, Error, Result, SpecTemplateVolume,
};
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Upper bound on a submitted document.
pub const MAX_MANIFEST_BYTES: usize = 1 << 20;
pub const DESCRIPTION_LIMIT: usize = 512;
const NAME_PATTERN: &str = r"^[a-z][a-z0-9-]{0,62}$";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManifestMeta {
    pub name: Option<String>,
    pub description: Option<String>,
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManifestSelector {
    pub node: String,
    pub labels: Option<BTreeMap<String, String>>,
}

/// Human quantities, e.g. `ram: 512Mi`, `cpu: 250m`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManifestQuantity {
    pub ram: String,
    pub cpu: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManifestResources {
    pub request: ManifestQuantity,
    pub limits: ManifestQuantity,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManifestContainer {
    pub name: String,
    pub image: ContainerImage,
    /// Space separated.
    pub command: String,
    pub args: Vec<String>,
    /// Space separated.
    pub entrypoint: String,
    pub workdir: String,
    pub env: Vec<ContainerEnv>,
    pub resources: ManifestResources,
    pub volumes: Vec<ContainerVolume>,
    pub ports: Vec<ContainerPort>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManifestTemplate {
    pub containers: Vec<ManifestContainer>,
    pub volumes: Vec<SpecTemplateVolume>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PodManifestSpec {
    pub selector: Option<ManifestSelector>,
    pub template: Option<ManifestTemplate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PodManifest {
    pub meta: ManifestMeta,
    pub spec: PodManifestSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeploymentManifestSpec {
    pub replicas: Option<u32>,
    pub selector: Option<ManifestSelector>,
    pub template: Option<ManifestTemplate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeploymentManifest {
    pub meta: ManifestMeta,
    pub spec: DeploymentManifestSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NamespaceManifest {
    pub meta: ManifestMeta,
}

/// Decoding and field validation shared by every manifest type.
pub trait Manifest: DeserializeOwned + Sized {
    /// Kind label used in validation messages.
    const SUBJECT: &'static str;

    fn validate(&self) -> Result<()>;

    fn from_json(data: &[u8]) -> Result<Self> {
        check_size(Self::SUBJECT, data)?;
        serde_json::from_slice(data).map_err(|e| Error::Validation(format!("{}: incorrect json: {}", Self::SUBJECT, e)))
    }

    fn from_yaml(data: &[u8]) -> Result<Self> {
        check_size(Self::SUBJECT, data)?;
        serde_yaml::from_slice(data).map_err(|e| Error::Validation(format!("{}: incorrect yaml: {}", Self::SUBJECT, e)))
    }

    /// JSON when the document starts with `{`, YAML otherwise; validated.
    fn decode(data: &[u8]) -> Result<Self> {
        let json = data.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{');
        let m = if json { Self::from_json(data)? } else { Self::from_yaml(data)? };
        m.validate()?;
        Ok(m)
    }
}

fn check_size(subject: &str, data: &[u8]) -> Result<()> {
    if data.len() > MAX_MANIFEST_BYTES {
        return Err(Error::Validation(format!(
            "{}: document is {} bytes, limit {}",
            subject,
            data.len(),
            MAX_MANIFEST_BYTES
        )));
    }
    Ok(())
}

fn bad(subject: &str, field: impl std::fmt::Display) -> Error {
    Error::Validation(format!("{}: bad parameter {}", subject, field))
}

struct Checker {
    subject: &'static str,
    name_re: Regex,
}

impl Checker {
    fn new(subject: &'static str) -> Result<Self> {
        let name_re = Regex::new(NAME_PATTERN).map_err(|e| Error::Validation(format!("name pattern: {}", e)))?;
        Ok(Self { subject, name_re })
    }

    fn meta(&self, meta: &ManifestMeta) -> Result<()> {
        if let Some(name) = &meta.name {
            if !self.name_re.is_match(name) {
                return Err(bad(self.subject, "name"));
            }
        }
        if meta.description.as_ref().map(|d| d.len() > DESCRIPTION_LIMIT).unwrap_or(false) {
            return Err(bad(self.subject, "description"));
        }
        Ok(())
    }

    fn unique<'a>(&self, field: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
        let mut seen = HashSet::new();
        for name in names {
            if name.is_empty() {
                return Err(bad(self.subject, format!("{}.name", field)));
            }
            if !seen.insert(name) {
                return Err(Error::Validation(format!("{}: duplicate {} {:?}", self.subject, field, name)));
            }
        }
        Ok(())
    }

    fn template(&self, t: &ManifestTemplate) -> Result<()> {
        self.unique("container", t.containers.iter().map(|c| c.name.as_str()))?;
        for c in &t.containers {
            if !self.name_re.is_match(&c.name) {
                return Err(bad(self.subject, "container.name"));
            }
            if c.image.name.trim().is_empty() {
                return Err(bad(self.subject, format!("container {}: image", c.name)));
            }
            self.unique("env", c.env.iter().map(|e| e.name.as_str()))?;
            self.unique("container volume", c.volumes.iter().map(|v| v.name.as_str()))?;
        }
        self.unique("volume", t.volumes.iter().map(|v| v.name.as_str()))?;
        for v in &t.volumes {
            if !self.name_re.is_match(&v.name) {
                return Err(bad(self.subject, "volume.name"));
            }
            if v.secret.binds.iter().chain(&v.config.binds).any(|b| b.key.is_empty() || b.file.is_empty()) {
                return Err(bad(self.subject, format!("volume {}: bind", v.name)));
            }
        }
        Ok(())
    }
}

impl Manifest for PodManifest {
    const SUBJECT: &'static str = "pod";

    fn validate(&self) -> Result<()> {
        let c = Checker::new(Self::SUBJECT)?;
        c.meta(&self.meta)?;
        if let Some(t) = &self.spec.template {
            c.template(t)?;
        }
        Ok(())
    }
}

impl Manifest for DeploymentManifest {
    const SUBJECT: &'static str = "deployment";

    fn validate(&self) -> Result<()> {
        let c = Checker::new(Self::SUBJECT)?;
        c.meta(&self.meta)?;
        if let Some(t) = &self.spec.template {
            c.template(t)?;
        }
        Ok(())
    }
}

impl Manifest for NamespaceManifest {
    const SUBJECT: &'static str = "namespace";

    fn validate(&self) -> Result<()> {
        Checker::new(Self::SUBJECT)?.meta(&self.meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POD_YAML: &str = r#"
meta:
  name: web
  labels:
    app: web
spec:
  selector:
    node: n1
  template:
    containers:
      - name: app
        image:
          name: nginx:1.25
        command: nginx -g daemon
        env:
          - name: MODE
            value: prod
          - name: TOKEN
            secret:
              name: creds
              key: token
        resources:
          request:
            ram: 512Mi
            cpu: 250m
        volumes:
          - name: conf
            path: /etc/nginx
            mode: ro
    volumes:
      - name: conf
        type: config
        config:
          name: nginx
          binds:
            - key: nginx.conf
              file: nginx.conf
"#;

    #[test]
    fn yaml_pod_decodes_and_validates() {
        let m = PodManifest::decode(POD_YAML.as_bytes()).unwrap();
        assert_eq!(m.meta.name.as_deref(), Some("web"));
        let t = m.spec.template.unwrap();
        assert_eq!(t.containers[0].env[1].secret.key, "token");
        assert_eq!(t.volumes[0].kind, "config");
        assert_eq!(t.volumes[0].config.binds.len(), 1);
    }

    #[test]
    fn json_is_detected() {
        let m = DeploymentManifest::decode(br#" {"meta":{"name":"api"},"spec":{"replicas":3}}"#).unwrap();
        assert_eq!(m.spec.replicas, Some(3));
    }

    #[test]
    fn rejects_bad_fields() {
        let mut m = PodManifest::from_yaml(POD_YAML.as_bytes()).unwrap();
        m.meta.name = Some("Web_1".into());
        assert!(matches!(m.validate(), Err(Error::Validation(_))));

        let mut m = PodManifest::from_yaml(POD_YAML.as_bytes()).unwrap();
        m.meta.description = Some("x".repeat(DESCRIPTION_LIMIT + 1));
        assert!(m.validate().is_err());

        let mut m = PodManifest::from_yaml(POD_YAML.as_bytes()).unwrap();
        let t = m.spec.template.as_mut().unwrap();
        let dup = t.containers[0].clone();
        t.containers.push(dup);
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate container"));
    }

    #[test]
    fn malformed_documents_are_validation_errors() {
        assert!(matches!(PodManifest::from_json(b"{nope"), Err(Error::Validation(_))));
        let big = vec![b' '; MAX_MANIFEST_BYTES + 1];
        assert!(matches!(NamespaceManifest::from_yaml(&big), Err(Error::Validation(_))));
    }
}
