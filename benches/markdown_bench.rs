use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ingestion_worker::markdown;

const SAMPLE_HTML: &str = r#"<!doctype html>
<html>
  <body>
    <h1>Title</h1>
    <p>Hello <strong>world</strong>. <a href="/docs/intro">Intro</a></p>
    <ul><li>One</li><li>Two</li></ul>
    <pre><code class="language-rust">fn main() { println!("hi"); }</code></pre>
    <table>
      <tr><th>Col A</th><th>Col B</th></tr>
      <tr><td>A1</td><td>B1</td></tr>
    </table>
  </body>
</html>"#;

const SAMPLE_MARKDOWN: &str = r#"# Title

Some reasonably long paragraph of real prose that should survive pruning.

[Home](/) [Docs](/docs) [API](/api)

Another paragraph with enough words to count as genuine content here.
"#;

fn bench_html_to_markdown(c: &mut Criterion) {
    c.bench_function("html_to_raw_markdown", |b| {
        b.iter(|| black_box(markdown::html_to_raw_markdown(black_box(SAMPLE_HTML))))
    });
}

fn bench_prune_to_fit(c: &mut Criterion) {
    c.bench_function("prune_to_fit", |b| {
        b.iter(|| black_box(markdown::prune_to_fit(black_box(SAMPLE_MARKDOWN))))
    });
}

fn bench_link_targets(c: &mut Criterion) {
    c.bench_function("link_targets", |b| {
        b.iter(|| black_box(markdown::link_targets(black_box(SAMPLE_MARKDOWN))))
    });
}

criterion_group!(benches, bench_html_to_markdown, bench_prune_to_fit, bench_link_targets);
criterion_main!(benches);
