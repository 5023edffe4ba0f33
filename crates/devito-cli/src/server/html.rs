//! The HTML shell and the live-reload client.

use devito_graph::ImportMap;

const ICON: &str = "data:image/svg+xml,%3Csvg viewBox='0 0 100 100' xmlns='http://www.w3.org/2000/svg'%3E%3Ccircle cx='50' cy='47.2' r='34'%0Afill='transparent' stroke='%23fff' stroke-width='7.5' /%3E%3C/svg%3E";

const STYLE: &str = r#"    html, body {
      margin: 0;
      padding: 0;
    }

    body {
      --light: #eee;
      --dark: #222;
      --color: var(--dark);
      --background: var(--light);
      color: var(--color);
      background: var(--background)
    }

    @media (prefers-color-scheme: dark) {
      body:not(.light) {
        --color: var(--light);
        --background: var(--dark);
      }
    }"#;

/// Page that loads `/bundle.css`, `/bundle.js` and the reload client.
///
/// Unbundled pages get an import map so bare specifiers resolve to `/@fs/`
/// URLs in the browser.
pub fn shell(title: &str, import_map: Option<&ImportMap>) -> String {
    let import_map = import_map
        .map(|map| format!("<script type=\"importmap\">\n{}\n</script>\n", import_map_json(map)))
        .unwrap_or_default();

    format!(
        r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0" />
  <link rel="icon" href="{ICON}" type="image/svg+xml" />
  <title>{title}</title>
  <style>
{STYLE}
  </style>
  <link rel="stylesheet" href="/bundle.css">
</head><body><main></main>
{import_map}<script src="/bundle.js" type="module"></script>
<script src="/devito.js" type="module" defer async></script>
</body></html>"#,
        title = escape(title),
    )
}

/// Unbundled pages report bare imports the browser failed to resolve.
const REPORT_MISSING: &str = r#"addEventListener('error', (event) => {
  const found = /Failed to resolve module specifier ["']([^"']+)["']/.exec(event.message ?? '');
  if (!found || !event.filename) return;
  const query = new URLSearchParams({ specifier: found[1], importer: new URL(event.filename).pathname });
  fetch('/onmissing?' + query);
});
"#;

/// `/devito.js`. Registers the service worker, then reloads the page on
/// the first bus message after `start`; an `error` message is logged
/// instead so the broken build stays visible.
pub fn client_script(watch: bool, quiet: bool, unbundled: bool) -> String {
    let mut register =
        "if ('serviceWorker' in navigator) navigator.serviceWorker.register('/devito-sw.js');\n"
            .to_string();
    if unbundled {
        register.push_str(REPORT_MISSING);
    }
    if !watch {
        return register;
    }

    let on_open = if quiet {
        ""
    } else {
        "es.onopen = () => console.warn('live-reload started');\n"
    };

    format!(
        r#"{register}const es = new EventSource('/onreload');
{on_open}es.onmessage = () => {{
  es.onmessage = ({{ data }}) => {{
    const {{ type, payload }} = JSON.parse(data);
    if (type === 'error') {{
      console.error(payload.message);
      return;
    }}
    es.close();
    setTimeout(() => location.reload(), 10);
  }};
}};
"#
    )
}

/// `/devito-sw.js`: keeps scripts and stylesheets in the browser's cache
/// between reloads.
///
/// The cache is dropped on every `start`, so a restarted server never
/// serves stale output, and each `update` deletes just the paths it names.
/// Requests before the first `start` go to the network untouched.
pub const SERVICE_WORKER: &str = r#"const CACHE = 'v1';
const es = new EventSource('/onreload');
let started = false;

es.onmessage = async ({ data }) => {
  const { type, payload } = JSON.parse(data);
  if (type === 'start') {
    await caches.delete(CACHE);
    started = true;
    return;
  }
  if (type === 'update') {
    const cache = await caches.open(CACHE);
    for (const target of payload) {
      await cache.delete(target);
    }
  }
};

async function cachedResponse(request) {
  const cached = await caches.match(request);
  if (cached) return cached;

  const response = await fetch(request, { cache: 'reload' });
  if (response.ok) {
    const copy = response.clone();
    caches.open(CACHE).then((cache) => cache.put(request, copy));
  }
  return response;
}

const CACHED_SUFFIXES = ['.js', '.js.map', '.css', '.css.map'];

addEventListener('fetch', (event) => {
  if (!started) return;
  const url = event.request.url;
  if (url.endsWith('/devito-sw.js') || url.endsWith('/devito.js')) return;
  if (CACHED_SUFFIXES.some((suffix) => url.endsWith(suffix))) {
    event.respondWith(cachedResponse(event.request));
  }
});
"#;

/// `</script>` inside JSON would end the script element early.
fn import_map_json(map: &ImportMap) -> String {
    map.to_json().replace("</", "<\\/")
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
