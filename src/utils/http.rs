use std::{collections::BTreeMap, sync::Arc};

use reqwest::{
    cookie::Jar,
    header::{self, HeaderMap, HeaderName, HeaderValue},
    redirect, Client, Response,
};
use serde::de::DeserializeOwned;

use crate::{config::PipelineConfig, platform::PlatformError};

pub const DESKTOP_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const MOBILE_UA: &str = "Mozilla/5.0 (Linux; Android 8.0.0; SM-G955U Build/R16NW) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/116.0.0.0 Mobile Safari/537.36";

/// Shared client wrapper used by every resolver.
#[derive(Clone)]
pub struct HttpService {
    client: Client,
}

impl HttpService {
    pub fn new(config: &PipelineConfig) -> Result<Self, reqwest::Error> {
        let client = build_client(config, true, config.proxy.as_deref())?;
        Ok(Self { client })
    }

    /// A client that reports 3xx responses instead of following them.
    pub fn without_redirects(config: &PipelineConfig) -> Result<Self, reqwest::Error> {
        let client = build_client(config, false, config.proxy.as_deref())?;
        Ok(Self { client })
    }

    /// A client sending everything through `proxy` instead of the global one.
    pub fn with_proxy(config: &PipelineConfig, proxy: &str) -> Result<Self, reqwest::Error> {
        let client = build_client(config, true, Some(proxy))?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn get(&self, url: &str, headers: HeaderMap) -> Result<Response, PlatformError> {
        debug!("GET {}", url);
        let response = self.client.get(url).headers(headers).send().await?;
        check_status(response, url)
    }

    pub async fn get_text(&self, url: &str, headers: HeaderMap) -> Result<String, PlatformError> {
        let response = self.get(url, headers).await?;
        Ok(response.text().await?)
    }

    /// Fetches a JSON document and parses it straight into its schema, so shape drift
    /// surfaces as `SchemaChanged`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: HeaderMap,
    ) -> Result<T, PlatformError> {
        debug!("GET json {} {:?}", url, query);
        let response = self.client.get(url).query(query).headers(headers).send().await?;
        let response = check_status(response, url)?;
        let body = response.text().await?;
        serde_json::from_str::<T>(&body)
            .map_err(|e| PlatformError::SchemaChanged(format!("{}: {}", url, e)))
    }
}

pub fn build_client(
    config: &PipelineConfig,
    follow_redirects: bool,
    proxy: Option<&str>,
) -> Result<Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7"),
    );

    let policy = if follow_redirects {
        redirect::Policy::limited(config.max_redirects)
    } else {
        redirect::Policy::none()
    };

    let builder = Client::builder()
        .timeout(config.request_timeout())
        .connect_timeout(config.connect_timeout())
        .cookie_provider(Arc::new(Jar::default()))
        .default_headers(headers)
        .redirect(policy)
        .user_agent(DESKTOP_UA);

    let builder = match proxy {
        Some(proxy) => {
            info!("Configuring client with proxy {}", proxy);
            builder.proxy(reqwest::Proxy::all(proxy)?)
        }
        None => builder,
    };

    builder.build()
}

fn check_status(response: Response, url: &str) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(PlatformError::from_status(status, url))
    }
}

/// Builds a header map, skipping pairs that are not valid header syntax.
pub fn header_map<'a, I>(pairs: I) -> HeaderMap
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("Skipping invalid header {}", name),
        }
    }
    headers
}

pub fn headers_from(map: &BTreeMap<String, String>) -> HeaderMap {
    header_map(map.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}
