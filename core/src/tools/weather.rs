use crate::tools::extract_string_arg;
use crate::traits::{Tool, ToolError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

const OPENWEATHER_URL: &str = "https://api.openweathermap.org/data/2.5/weather";

#[derive(Debug, Deserialize)]
struct WeatherResponse {
    main: WeatherMain,
    weather: Vec<WeatherCondition>,
}

#[derive(Debug, Deserialize)]
struct WeatherMain {
    temp: f64,
    humidity: f64,
}

#[derive(Debug, Deserialize)]
struct WeatherCondition {
    description: String,
}

pub struct WeatherTool {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl WeatherTool {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "weather_search"
    }

    fn description(&self) -> &str {
        "Search for weather information"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "location": {
                    "type": "string",
                    "description": "The location to get weather for"
                }
            },
            "required": ["location"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let location = extract_string_arg(&args, "location")?;

        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ToolError::Unavailable(
                "no weather API key configured".to_string(),
            ));
        };

        let response = self
            .client
            .get(OPENWEATHER_URL)
            .query(&[
                ("q", location.as_str()),
                ("appid", api_key),
                ("units", "metric"),
            ])
            .send()
            .await
            .map_err(|e| ToolError::Unavailable(format!("weather request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ToolError::Unavailable(format!(
                "weather provider returned {}",
                response.status()
            )));
        }

        let data: WeatherResponse = response
            .json()
            .await
            .map_err(|e| ToolError::Unavailable(format!("unexpected weather payload: {e}")))?;

        let condition = data
            .weather
            .first()
            .map(|c| c.description.as_str())
            .unwrap_or("unknown");

        Ok(format!(
            "Weather in {}:\nTemperature: {}°C\nCondition: {}\nHumidity: {}%",
            location, data.main.temp, condition, data.main.humidity
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unavailable_without_api_key() {
        let tool = WeatherTool::new(None);
        let result = tool
            .execute(serde_json::json!({"location": "Berlin"}))
            .await;
        assert!(matches!(result, Err(ToolError::Unavailable(_))));
    }

    #[tokio::test]
    async fn missing_location_is_invalid() {
        let tool = WeatherTool::new(Some("key".to_string()));
        let result = tool.execute(serde_json::json!({})).await;
        assert!(matches!(result, Err(ToolError::InvalidArguments(_))));
    }
}
