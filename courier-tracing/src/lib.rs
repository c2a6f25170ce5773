//! Attribute macros for tracing courier's lifecycle functions.
//!
//! `#[traced]` emits a `trace` event when the function is entered and another
//! when it returns (or unwinds), optionally with the elapsed time, and can
//! forward arguments to `tracing::instrument`:
//!
//! ```ignore
//! #[traced(instrument(level = tracing::Level::INFO, skip_all), timing(precision = "ms"))]
//! async fn connect(&self) -> Result<(), BrokerError> { ... }
//! ```
//!
//! The expansion refers to `tracing::...`, so the calling crate needs a
//! `tracing` path in scope (either the crate itself or the re-export in
//! `courier_common`).

extern crate proc_macro;

use proc_macro2::TokenStream;
use quote::quote;
use syn::{ItemFn, Stmt, parse::Parse, parse_macro_input, parse_quote};

mod keywords {
    syn::custom_keyword!(timing);
    syn::custom_keyword!(precision);
    syn::custom_keyword!(instrument);
}

/// Unit used when reporting how long a traced function ran for.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
enum Precision {
    #[default]
    Nanos,
    Micros,
    Millis,
    Seconds,
}

impl Precision {
    fn parse_unit(unit: &syn::LitStr) -> syn::Result<Self> {
        match unit.value().as_str() {
            "ns" | "nanos" | "nanoseconds" => Ok(Self::Nanos),
            "us" | "micros" | "microseconds" => Ok(Self::Micros),
            "ms" | "millis" | "milliseconds" => Ok(Self::Millis),
            "s" | "secs" | "seconds" => Ok(Self::Seconds),
            other => Err(syn::Error::new(
                unit.span(),
                format!("unknown timing precision `{other}`, expected one of ns, us, ms, s"),
            )),
        }
    }

    /// Expression rendering `elapsed` (a `Duration`) in this unit.
    fn render(self) -> TokenStream {
        match self {
            Self::Nanos => quote!(format!("{} ns elapsed", elapsed.as_nanos())),
            Self::Micros => quote!(format!("{} us elapsed", elapsed.as_micros())),
            Self::Millis => quote!(format!("{} ms elapsed", elapsed.as_millis())),
            Self::Seconds => quote!(format!("{} s elapsed", elapsed.as_secs())),
        }
    }
}

impl Parse for Precision {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        if !input.peek(syn::token::Paren) {
            return Ok(Self::default());
        }

        let content;
        syn::parenthesized!(content in input);
        content.parse::<keywords::precision>()?;
        content.parse::<syn::Token![=]>()?;
        Self::parse_unit(&content.parse::<syn::LitStr>()?)
    }
}

#[derive(Default)]
struct Attributes {
    timing: Option<Precision>,
    instrument: Option<TokenStream>,
}

impl Parse for Attributes {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let mut attributes = Self::default();

        while !input.is_empty() {
            let lookahead = input.lookahead1();
            if lookahead.peek(keywords::timing) {
                let keyword = input.parse::<keywords::timing>()?;
                if attributes.timing.is_some() {
                    return Err(syn::Error::new(keyword.span, "`timing` given more than once"));
                }
                attributes.timing = Some(input.parse()?);
            } else if lookahead.peek(keywords::instrument) {
                let keyword = input.parse::<keywords::instrument>()?;
                if attributes.instrument.is_some() {
                    return Err(syn::Error::new(
                        keyword.span,
                        "`instrument` given more than once",
                    ));
                }
                attributes.instrument = Some(if input.peek(syn::token::Paren) {
                    let content;
                    syn::parenthesized!(content in input);
                    content.parse()?
                } else {
                    TokenStream::new()
                });
            } else if lookahead.peek(syn::Token![,]) {
                input.parse::<syn::Token![,]>()?;
            } else {
                return Err(lookahead.error());
            }
        }

        Ok(attributes)
    }
}

/// Adds `tracing::trace!` events at the start and end of an attributed function.
///
/// Accepts `instrument(...)`, forwarded verbatim to `#[tracing::instrument]`,
/// and `timing(precision = "ms")`, which appends the elapsed time to the exit
/// event.
#[proc_macro_attribute]
pub fn traced(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let attributes = parse_macro_input!(args as Attributes);
    let mut function = parse_macro_input!(item as ItemFn);

    function
        .attrs
        .push(parse_quote!(#[allow(clippy::items_after_statements)]));

    if let Some(fields) = attributes.instrument {
        function
            .attrs
            .push(parse_quote!(#[tracing::instrument(#fields)]));
    }

    let name = function.sig.ident.to_string();
    let on_exit = attributes.timing.map_or_else(
        || quote!(tracing::trace!("OnExit: {}", self.name);),
        |precision| {
            let rendered = precision.render();
            quote! {
                let elapsed = self.started.elapsed();
                tracing::trace!("OnExit: {} ({})", self.name, #rendered);
            }
        },
    );

    let guard: Vec<Stmt> = parse_quote! {
        struct __TracedGuard {
            name: &'static str,
            started: std::time::Instant,
        }

        impl std::ops::Drop for __TracedGuard {
            fn drop(&mut self) {
                #on_exit
            }
        }

        tracing::trace!("OnEnter: {}", #name);
        let __traced_guard = __TracedGuard {
            name: #name,
            started: std::time::Instant::now(),
        };
    };

    let body = std::mem::take(&mut function.block.stmts);
    function.block.stmts = guard.into_iter().chain(body).collect();

    quote!(#function).into()
}
