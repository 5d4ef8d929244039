// Hot paths that run on every load or every call, outside the sandbox.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use paw_tool_runtime::atoms::types::{ParamType, ParameterSpec};
use paw_tool_runtime::engine::functions::builtins::BUILTIN_SCRIPTS;
use paw_tool_runtime::engine::functions::extract_schemas;
use paw_tool_runtime::engine::tools::validate::validate_arguments;
use paw_tool_runtime::{RuntimeConfig, ToolRuntime};
use serde_json::json;

fn bench_extract_schemas(c: &mut Criterion) {
    c.bench_function("extract_schemas/builtins", |b| {
        b.iter(|| {
            for (_, source) in BUILTIN_SCRIPTS {
                black_box(extract_schemas(black_box(source)).unwrap());
            }
        })
    });
}

fn bench_registry(c: &mut Criterion) {
    let rt = ToolRuntime::new(RuntimeConfig::default()).unwrap();
    let registry = rt.registry();
    c.bench_function("registry/list", |b| b.iter(|| black_box(registry.list())));
    c.bench_function("registry/get_hit", |b| b.iter(|| black_box(registry.get("slugify"))));
    c.bench_function("registry/get_miss", |b| b.iter(|| black_box(registry.get("github_get_repo"))));
}

fn bench_validate(c: &mut Criterion) {
    let params = vec![
        ParameterSpec::required("owner", ParamType::String, ""),
        ParameterSpec::required("repo", ParamType::String, ""),
        ParameterSpec::optional("per_page", ParamType::Integer, ""),
        ParameterSpec::optional("labels", ParamType::Array, ""),
    ];
    let args = json!({"owner": "paw", "repo": "runtime", "per_page": 50, "labels": ["bug"]});
    c.bench_function("validate_arguments", |b| {
        b.iter(|| validate_arguments("bench", black_box(&params), black_box(&args)).unwrap())
    });
}

criterion_group!(benches, bench_extract_schemas, bench_registry, bench_validate);
criterion_main!(benches);
