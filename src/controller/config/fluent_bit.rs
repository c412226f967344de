//! Log agent (Fluent Bit) configuration
//!
//! Log pipelines with an HTTP or custom output are served by a Fluent
//! Bit DaemonSet. Each pipeline gets its own tail input, tagged with the
//! pipeline name, so its filters and its output only see its own
//! records.
//!
//! Output values, inline or from a Secret, are referenced as `${VAR}`
//! and shipped in the env Secret. TLS material is shipped as files in a
//! separate Secret, since PEM blocks may exceed the allowed size of an
//! env value.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use kube::ResourceExt;

use super::{EnvVars, CLUSTER_NAME_ATTRIBUTE};
use crate::controller::secrets::ResolvedValues;
use crate::crd::{ApplicationInput, HttpOutput, LogPipeline, TelemetryPipeline, ValueType};
use crate::error::{Error, Result};

pub const CONFIG_FILE: &str = "fluent-bit.conf";
pub const PARSERS_FILE: &str = "parsers.conf";
pub const LUA_SCRIPT_FILE: &str = "filter-script.lua";

pub const CONFIG_DIR: &str = "/fluent-bit/etc";
pub const PARSERS_DIR: &str = "/fluent-bit/etc/parsers";
pub const TLS_DIR: &str = "/fluent-bit/etc/output-tls-config";

const LOG_DIR: &str = "/var/log/containers";
const SYSTEM_NAMESPACES: [&str; 3] = ["kube-system", "istio-system", "kube-public"];
const HTTP_PORT: u16 = 2020;

/// Rendered documents and the values they reference
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FluentBitConfig {
    /// Main configuration, `fluent-bit.conf`
    pub main: String,
    /// Parser definitions, `parsers.conf`
    pub parsers: String,
    pub lua_script: String,
    /// Content of the env Secret
    pub env: EnvVars,
    /// Content of the TLS file Secret
    pub tls_files: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
pub struct FluentBitOptions {
    /// Name of the agent DaemonSet; its own logs are never collected
    pub workload_name: String,
    pub namespace: String,
    pub log_level: String,
    pub cluster_name: Option<String>,
}

/// One `[SECTION]` of the classic configuration format
#[derive(Debug, Default)]
struct Section {
    header: &'static str,
    entries: Vec<(String, String)>,
}

impl Section {
    fn new(header: &'static str) -> Self {
        Self {
            header,
            entries: Vec::new(),
        }
    }

    fn entry(mut self, key: &str, value: impl Into<String>) -> Self {
        self.entries.push((key.to_string(), value.into()));
        self
    }

    /// Raw `key value` lines written by the user
    fn raw(mut self, fragment: &str) -> Self {
        for line in fragment.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (key, value) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            self.entries
                .push((key.to_lowercase(), value.trim().to_string()));
        }
        self
    }

    /// `name`, `match` and `alias` first, then alphabetical
    fn render(mut self) -> String {
        let rank = |key: &str| match key {
            "name" => 0,
            "match" => 1,
            "alias" => 2,
            _ => 3,
        };
        self.entries
            .sort_by(|(a, _), (b, _)| rank(a).cmp(&rank(b)).then_with(|| a.cmp(b)));
        let width = self.entries.iter().map(|(k, _)| k.len()).max().unwrap_or(0);

        let mut out = format!("[{}]\n", self.header);
        for (key, value) in &self.entries {
            let _ = writeln!(out, "    {key:<width$} {value}");
        }
        out.push('\n');
        out
    }
}

/// Env variable carrying `field` of the output of `pipeline`
pub fn output_variable(pipeline: &str, field: &str) -> String {
    format!("{field}_{}", super::env_var_suffix(pipeline))
}

/// Config text for an output value: always an env reference, with the
/// inline or resolved value going into `env`
fn value_ref(
    pipeline: &str,
    field: &str,
    value: &ValueType,
    values: &ResolvedValues,
    env: &mut EnvVars,
) -> String {
    let var = output_variable(pipeline, field);
    env.insert(var.clone(), values.get(value).unwrap_or_default().to_string());
    format!("${{{var}}}")
}

fn service_section(opts: &FluentBitOptions) -> String {
    let level = if opts.log_level.is_empty() {
        "info"
    } else {
        opts.log_level.as_str()
    };
    Section::new("SERVICE")
        .entry("daemon", "off")
        .entry("flush", "1")
        .entry("log_level", level)
        .entry("parsers_file", format!("{PARSERS_DIR}/{PARSERS_FILE}"))
        .entry("http_server", "on")
        .entry("http_listen", "0.0.0.0")
        .entry("http_port", HTTP_PORT.to_string())
        .entry("storage.path", "/data/flb-storage/")
        .entry("storage.metrics", "on")
        .render()
}

fn log_path(namespace: &str, container: &str) -> String {
    format!("{LOG_DIR}/*_{namespace}_{container}-*.log")
}

/// Tail include and exclude paths of an application input
pub fn tail_paths(
    input: &ApplicationInput,
    opts: &FluentBitOptions,
) -> (Vec<String>, Vec<String>) {
    let namespaces = &input.namespaces;
    let containers = &input.containers;

    let included_namespaces: Vec<&str> = if namespaces.include.is_empty() {
        vec!["*"]
    } else {
        namespaces.include.iter().map(String::as_str).collect()
    };
    let included_containers: Vec<&str> = if containers.include.is_empty() {
        vec!["*"]
    } else {
        containers.include.iter().map(String::as_str).collect()
    };
    let include = included_namespaces
        .iter()
        .flat_map(|ns| included_containers.iter().map(move |c| log_path(ns, c)))
        .collect();

    let mut exclude = vec![format!(
        "{LOG_DIR}/{}-*_{}_fluent-bit-*.log",
        opts.workload_name, opts.namespace
    )];
    if namespaces.include.is_empty() && !namespaces.system {
        exclude.push(log_path(&opts.namespace, "*"));
        exclude.extend(SYSTEM_NAMESPACES.iter().map(|ns| log_path(ns, "*")));
    }
    exclude.extend(namespaces.exclude.iter().map(|ns| log_path(ns, "*")));
    exclude.extend(containers.exclude.iter().map(|c| log_path("*", c)));
    (include, exclude)
}

fn input_section(name: &str, input: &ApplicationInput, opts: &FluentBitOptions) -> String {
    let (include, exclude) = tail_paths(input, opts);
    Section::new("INPUT")
        .entry("name", "tail")
        .entry("alias", format!("tail-{name}"))
        .entry("tag", format!("{name}.*"))
        .entry("path", include.join(","))
        .entry("exclude_path", exclude.join(","))
        .entry("db", format!("/data/flb_{name}.db"))
        .entry("multiline.parser", "cri")
        .entry("mem_buf_limit", "5MB")
        .entry("read_from_head", "true")
        .entry("skip_long_lines", "on")
        .entry("storage.type", "filesystem")
        .render()
}

fn kubernetes_filter(name: &str, input: &ApplicationInput) -> String {
    let on_off = |on: bool| if on { "on" } else { "off" };
    Section::new("FILTER")
        .entry("name", "kubernetes")
        .entry("match", format!("{name}.*"))
        .entry("merge_log", "on")
        .entry("keep_log", "on")
        .entry("k8s-logging.parser", "on")
        .entry("k8s-logging.exclude", "off")
        .entry("annotations", on_off(input.keep_annotations))
        .entry("labels", on_off(!input.drop_labels))
        .entry("buffer_size", "1MB")
        .entry("kube_tag_prefix", format!("{name}.var.log.containers."))
        .render()
}

fn dedot_filter(name: &str) -> String {
    Section::new("FILTER")
        .entry("name", "lua")
        .entry("match", format!("{name}.*"))
        .entry("script", format!("{CONFIG_DIR}/{LUA_SCRIPT_FILE}"))
        .entry("call", "kubernetes_map_keys")
        .render()
}

fn cluster_name_filter(name: &str, cluster: &str) -> String {
    Section::new("FILTER")
        .entry("name", "record_modifier")
        .entry("match", format!("{name}.*"))
        .entry("record", format!("{CLUSTER_NAME_ATTRIBUTE} {cluster}"))
        .render()
}

fn tls_file_name(pipeline: &str, kind: &str) -> String {
    match kind {
        "key" => format!("{pipeline}-key.key"),
        other => format!("{pipeline}-{other}.crt"),
    }
}

fn http_output_section(
    name: &str,
    http: &HttpOutput,
    values: &ResolvedValues,
    config: &mut FluentBitConfig,
) -> String {
    let mut section = Section::new("OUTPUT")
        .entry("name", "http")
        .entry("match", format!("{name}.*"))
        .entry("alias", format!("logs/{name}"))
        .entry("allow_duplicated_headers", "true")
        .entry("retry_limit", "300")
        .entry("storage.total_limit_size", "1G")
        .entry(
            "host",
            value_ref(name, "HTTP_HOST", &http.host, values, &mut config.env),
        )
        .entry(
            "port",
            if http.port.is_empty() { "443" } else { http.port.as_str() },
        )
        .entry("uri", if http.uri.is_empty() { "/" } else { http.uri.as_str() })
        .entry(
            "format",
            if http.format.is_empty() { "json" } else { http.format.as_str() },
        );

    if http.user.is_defined() {
        section = section.entry(
            "http_user",
            value_ref(name, "HTTP_USER", &http.user, values, &mut config.env),
        );
    }
    if http.password.is_defined() {
        section = section.entry(
            "http_passwd",
            value_ref(name, "HTTP_PASSWORD", &http.password, values, &mut config.env),
        );
    }
    if !http.compress.is_empty() {
        section = section.entry("compress", http.compress.as_str());
    }

    let tls = &http.tls;
    if tls.disabled {
        return section
            .entry("tls", "off")
            .entry("tls.verify", "off")
            .render();
    }
    section = section.entry("tls", "on").entry(
        "tls.verify",
        if tls.skip_certificate_validation { "off" } else { "on" },
    );

    let mut add_file = |section: Section, kind: &str, key: &str, value: &str| {
        let file = tls_file_name(name, kind);
        config
            .tls_files
            .insert(file.clone(), value.replace("\\n", "\n"));
        section.entry(key, format!("{TLS_DIR}/{file}"))
    };
    if let Some(ca) = values.get_opt(tls.ca.as_ref()).filter(|v| !v.is_empty()) {
        section = add_file(section, "ca", "tls.ca_file", ca);
    }
    let cert = values.get_opt(tls.cert.as_ref()).filter(|v| !v.is_empty());
    let key = values.get_opt(tls.key.as_ref()).filter(|v| !v.is_empty());
    if let (Some(cert), Some(key)) = (cert, key) {
        section = add_file(section, "cert", "tls.crt_file", cert);
        section = add_file(section, "key", "tls.key_file", key);
    }
    section.render()
}

fn custom_output_section(name: &str, fragment: &str) -> String {
    Section::new("OUTPUT")
        .raw(fragment)
        .entry("match", format!("{name}.*"))
        .entry("alias", format!("logs/{name}"))
        .entry("retry_limit", "300")
        .entry("storage.total_limit_size", "1G")
        .render()
}

fn pipeline_sections(
    pipeline: &LogPipeline,
    values: &ResolvedValues,
    opts: &FluentBitOptions,
    config: &mut FluentBitConfig,
) -> Result<String> {
    let name = pipeline.name_any();
    let spec = &pipeline.spec;
    let input = spec.input.application.clone().unwrap_or_default();

    let mut out = input_section(&name, &input, opts);
    out.push_str(&kubernetes_filter(&name, &input));
    if let Some(cluster) = opts.cluster_name.as_deref() {
        out.push_str(&cluster_name_filter(&name, cluster));
    }
    for filter in spec.filters.iter().filter(|f| !f.custom.trim().is_empty()) {
        out.push_str(
            &Section::new("FILTER")
                .raw(&filter.custom)
                .entry("match", format!("{name}.*"))
                .render(),
        );
    }

    if let Some(http) = spec.output.http.as_ref().filter(|_| spec.output.is_http_defined()) {
        if http.dedot {
            out.push_str(&dedot_filter(&name));
        }
        out.push_str(&http_output_section(&name, http, values, config));
    } else if spec.output.is_custom_defined() {
        out.push_str(&custom_output_section(&name, &spec.output.custom));
    } else {
        return Err(Error::ConfigError(format!(
            "LogPipeline {name} has no output the log agent can serve"
        )));
    }
    Ok(out)
}

/// Render the agent configuration for the reconcilable pipelines
///
/// Only pipelines served by the agent contribute; they are rendered
/// sorted by name.
pub fn build(
    pipelines: &[(&LogPipeline, &ResolvedValues)],
    opts: &FluentBitOptions,
) -> Result<FluentBitConfig> {
    let mut config = FluentBitConfig {
        parsers: PARSERS.to_string(),
        lua_script: LUA_SCRIPT.to_string(),
        ..Default::default()
    };

    let mut sorted: Vec<&(&LogPipeline, &ResolvedValues)> = pipelines
        .iter()
        .filter(|(p, _)| p.requires_agent())
        .collect();
    sorted.sort_by_key(|(p, _)| p.name_any());

    let mut main = service_section(opts);
    for (pipeline, values) in sorted {
        let sections = pipeline_sections(pipeline, values, opts, &mut config)?;
        main.push_str(&sections);
    }
    config.main = main;
    Ok(config)
}

const PARSERS: &str = r#"[PARSER]
    Name        docker_no_time
    Format      json
    Time_Keep   Off
    Time_Key    time
    Time_Format %d/%b/%Y:%H:%M:%S %z

[PARSER]
    Name        json
    Format      json

[PARSER]
    Name        logfmt
    Format      logfmt
"#;

const LUA_SCRIPT: &str = r#"function kubernetes_map_keys(tag, timestamp, record)
  if record.kubernetes == nil then
    return 0
  end
  map_keys(record.kubernetes.annotations)
  map_keys(record.kubernetes.labels)
  return 1, timestamp, record
end

function map_keys(table)
  if table == nil then
    return
  end
  local new_table = {}
  local changed_keys = {}
  for key, val in pairs(table) do
    local mapped_key = string.gsub(key, "[%/%.]", "_")
    if mapped_key ~= key then
      new_table[mapped_key] = val
      changed_keys[key] = true
    end
  end
  for key in pairs(changed_keys) do
    table[key] = nil
  end
  for key, val in pairs(new_table) do
    table[key] = val
  end
end
"#;
